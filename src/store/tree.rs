//! Trees: a named key space split across a fixed set of pages

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::accumulator::{Accumulator, AccumulatorType};
use crate::error::{KeelError, Result};
use crate::txn::TransactionIndex;

use super::page::{Page, PageHandle, PageId};

/// A tree
///
/// Keys are spread over `pages` by CRC32 of the key, so each key lives in
/// exactly one page and is guarded by that page's latch. Ordered access
/// merges the pages.
#[derive(Debug)]
pub struct Tree {
    id: u32,
    name: String,
    created_at: u64,
    pages: Vec<Page>,
    accumulators: Mutex<HashMap<u32, Arc<Accumulator>>>,
}

impl Tree {
    pub fn new(id: u32, name: impl Into<String>, created_at: u64, page_count: usize) -> Self {
        let pages = (0..page_count.max(1))
            .map(|page_no| Page::new(PageId { tree_id: id, page_no }))
            .collect();
        Self {
            id,
            name: name.into(),
            created_at,
            pages,
            accumulators: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timestamp the tree was created at
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Page slot holding `key`
    pub fn page_for(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.pages.len()
    }

    pub fn page(&self, page_no: usize) -> &Page {
        &self.pages[page_no % self.pages.len()]
    }

    /// Latch page `page_no`
    pub fn acquire(&self, page_no: usize) -> PageHandle<'_> {
        self.page(page_no).acquire()
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter()
    }

    // =========================================================================
    // Accumulators
    // =========================================================================

    /// The accumulator at `index`, created with `base` on first use.
    ///
    /// Asking again with a different kind is an error.
    pub fn accumulator(
        &self,
        index: u32,
        kind: AccumulatorType,
        base: i64,
    ) -> Result<Arc<Accumulator>> {
        let mut accumulators = self.accumulators.lock();
        if let Some(existing) = accumulators.get(&index) {
            if existing.kind() != kind {
                return Err(KeelError::InvalidState(format!(
                    "accumulator {} of tree {} is {:?}, not {:?}",
                    index,
                    self.name,
                    existing.kind(),
                    kind
                )));
            }
            return Ok(Arc::clone(existing));
        }
        let accumulator = Arc::new(Accumulator::new(self.id, index, kind, base));
        accumulators.insert(index, Arc::clone(&accumulator));
        Ok(accumulator)
    }

    /// Accumulators of this tree, ordered by index
    pub fn accumulators(&self) -> Vec<Arc<Accumulator>> {
        let mut all: Vec<_> = self.accumulators.lock().values().cloned().collect();
        all.sort_by_key(|a| a.index());
        all
    }

    /// Fold committed deltas below `floor` into each accumulator's base
    pub fn fold_accumulators(&self, index: &TransactionIndex, floor: u64) -> usize {
        self.accumulators()
            .iter()
            .map(|acc| acc.fold(index, floor))
            .sum()
    }
}
