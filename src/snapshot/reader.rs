//! Snapshot Reader
//!
//! Loads a checkpoint image into memory and validates it before use.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{KeelError, Result};

use super::{SnapshotManifest, ENTRY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// One key value of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEntry<'a> {
    pub tree_id: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// A validated checkpoint image
pub struct SnapshotReader {
    path: PathBuf,
    bytes: Vec<u8>,
    timestamp: u64,
    entry_count: u64,
    /// End of the data block
    manifest_offset: usize,
    manifest: SnapshotManifest,
}

impl SnapshotReader {
    /// Read and validate the image at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let bad = |reason: String| KeelError::BadImage {
            path: path.display().to_string(),
            reason,
        };

        if (bytes.len() as u64) < HEADER_SIZE + FOOTER_SIZE {
            return Err(bad(format!("{} bytes is too short", bytes.len())));
        }
        if &bytes[0..4] != MAGIC {
            return Err(bad(format!("invalid magic {:?}", &bytes[0..4])));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(bad(format!("unsupported version {}", version)));
        }
        let timestamp = read_u64(&bytes, 6);
        let entry_count = read_u64(&bytes, 14);

        let footer_at = bytes.len() - FOOTER_SIZE as usize;
        let manifest_offset = read_u64(&bytes, footer_at) as usize;
        let stored_crc = read_u32(&bytes, footer_at + 8);
        if manifest_offset < HEADER_SIZE as usize || manifest_offset + 4 > footer_at {
            return Err(bad(format!("manifest offset {} out of range", manifest_offset)));
        }
        let computed = crc32fast::hash(&bytes[HEADER_SIZE as usize..footer_at]);
        if computed != stored_crc {
            return Err(bad(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, computed
            )));
        }

        let manifest_len = read_u32(&bytes, manifest_offset) as usize;
        let manifest_start = manifest_offset + 4;
        if manifest_start + manifest_len != footer_at {
            return Err(bad(format!("manifest length {} does not fit", manifest_len)));
        }
        let manifest: SnapshotManifest =
            bincode::deserialize(&bytes[manifest_start..manifest_start + manifest_len])?;
        if manifest.timestamp != timestamp {
            return Err(bad(format!(
                "manifest timestamp {} differs from header {}",
                manifest.timestamp, timestamp
            )));
        }

        let reader = Self {
            path: path.to_path_buf(),
            bytes,
            timestamp,
            entry_count,
            manifest_offset,
            manifest,
        };
        let counted = reader.entries().try_fold(0u64, |n, e| e.map(|_| n + 1))?;
        if counted != entry_count {
            return Err(bad(format!(
                "header counts {} entries, data block holds {}",
                entry_count, counted
            )));
        }
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    /// Entries in (tree, key) order
    pub fn entries(&self) -> SnapshotIter<'_> {
        SnapshotIter {
            reader: self,
            pos: HEADER_SIZE as usize,
        }
    }
}

pub struct SnapshotIter<'a> {
    reader: &'a SnapshotReader,
    pos: usize,
}

impl<'a> Iterator for SnapshotIter<'a> {
    type Item = Result<SnapshotEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.reader.manifest_offset;
        if self.pos >= end {
            return None;
        }
        let bytes = &self.reader.bytes;
        if self.pos + ENTRY_HEADER_SIZE > end {
            self.pos = end;
            return Some(Err(self.truncated()));
        }
        let tree_id = read_u32(bytes, self.pos);
        let key_len = read_u32(bytes, self.pos + 4) as usize;
        let val_len = read_u32(bytes, self.pos + 8) as usize;
        let key_start = self.pos + ENTRY_HEADER_SIZE;
        let val_start = key_start + key_len;
        let next = val_start + val_len;
        if next > end {
            self.pos = end;
            return Some(Err(self.truncated()));
        }
        self.pos = next;
        Some(Ok(SnapshotEntry {
            tree_id,
            key: &bytes[key_start..val_start],
            value: &bytes[val_start..next],
        }))
    }
}

impl<'a> SnapshotIter<'a> {
    fn truncated(&self) -> KeelError {
        KeelError::BadImage {
            path: self.reader.path.display().to_string(),
            reason: format!("entry at offset {} runs past the data block", self.pos),
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
