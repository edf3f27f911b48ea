//! Latched pages holding MVV records

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::{Mutex, MutexGuard};

/// Identifies a page: owning tree and slot within the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub tree_id: u32,
    pub page_no: usize,
}

#[derive(Debug, Default)]
pub struct PageData {
    records: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Bytes of keys and records held
    bytes: usize,
    /// Timestamp of the last modification
    dirty_ts: u64,
    /// Set when a non-primordial version is written; cleared by pruning
    needs_prune: bool,
}

/// A page: a set of MVV records behind one exclusive latch
#[derive(Debug)]
pub struct Page {
    id: PageId,
    latch: Mutex<PageData>,
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            latch: Mutex::new(PageData::default()),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Take the page latch exclusively; released when the handle drops
    pub fn acquire(&self) -> PageHandle<'_> {
        PageHandle {
            id: self.id,
            data: self.latch.lock(),
        }
    }

    /// Cheap check used by cleanup to skip clean pages
    pub fn needs_prune(&self) -> bool {
        self.latch.lock().needs_prune
    }
}

/// Exclusive access to one page
pub struct PageHandle<'a> {
    id: PageId,
    data: MutexGuard<'a, PageData>,
}

impl<'a> PageHandle<'a> {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn read_mvv_record(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.records.get(key).map(Vec::as_slice)
    }

    /// Replace the record for `key`; an empty record removes the key
    pub fn write_mvv_record(&mut self, key: &[u8], record: Vec<u8>) {
        let data = &mut *self.data;
        if record.is_empty() {
            if let Some(old) = data.records.remove(key) {
                data.bytes -= key.len() + old.len();
            }
            return;
        }
        let new_len = record.len();
        match data.records.insert(key.to_vec(), record) {
            Some(old) => data.bytes = data.bytes - old.len() + new_len,
            None => data.bytes += key.len() + new_len,
        }
    }

    pub fn mark_dirty(&mut self, timestamp: u64) {
        self.data.dirty_ts = self.data.dirty_ts.max(timestamp);
    }

    pub fn set_needs_prune(&mut self, needs_prune: bool) {
        self.data.needs_prune = needs_prune;
    }

    pub fn dirty_timestamp(&self) -> u64 {
        self.data.dirty_ts
    }

    /// Keys in `[from, to)`, in order
    pub fn keys_in_range(&self, from: &[u8], to: &[u8]) -> Vec<Vec<u8>> {
        if from >= to {
            return Vec::new();
        }
        self.data
            .records
            .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.data.records.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.data
            .records
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn record_count(&self) -> usize {
        self.data.records.len()
    }

    pub fn byte_size(&self) -> usize {
        self.data.bytes
    }
}
