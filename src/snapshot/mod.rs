//! Snapshot Module
//!
//! Checkpoint images: every key value visible at a checkpoint timestamp,
//! plus a manifest of trees and accumulator values as of that timestamp.
//! Recovery loads the newest image, then replays the journal from the
//! checkpoint's base address.
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ Header (22 bytes)                                              │
//! │   Magic: "KCKP" (4) | Version: u16 (2) | Timestamp: u64 (8)    │
//! │   Count: u64 (8)                                               │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                          │
//! │   [TreeId: u32][KeyLen: u32][ValLen: u32][Key][Value]          │
//! │   ... ordered by tree id, then key ...                         │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Manifest Block (variable)                                      │
//! │   [Len: u32][bincode SnapshotManifest]                         │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                              │
//! │   ManifestOffset: u64 (8) | CRC: u32 (4) | Padding (4)         │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//! The CRC covers the data and manifest blocks.

mod builder;
mod reader;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::accumulator::AccumulatorType;
use crate::error::Result;

pub use builder::SnapshotBuilder;
pub use reader::{SnapshotEntry, SnapshotReader};

// =============================================================================
// Shared Constants (used by builder and reader)
// =============================================================================

/// Magic bytes identifying a KeelKV checkpoint image
pub(crate) const MAGIC: &[u8; 4] = b"KCKP";

/// Current image format version
pub(crate) const VERSION: u16 = 1;

/// Magic (4) + Version (2) + Timestamp (8) + EntryCount (8) = 22 bytes
pub(crate) const HEADER_SIZE: u64 = 22;

/// ManifestOffset (8) + CRC (4) + Padding (4) = 16 bytes
pub(crate) const FOOTER_SIZE: u64 = 16;

/// Per-entry header: TreeId (4) + KeyLen (4) + ValLen (4)
pub(crate) const ENTRY_HEADER_SIZE: usize = 12;

const FILE_PREFIX: &str = "checkpoint_";
const FILE_SUFFIX: &str = ".snap";

// =============================================================================
// Manifest
// =============================================================================

/// Trees and accumulator values as of the image's timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub timestamp: u64,
    /// Next unused tree id when the image was taken
    pub next_tree_id: u32,
    pub trees: Vec<TreeManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeManifest {
    pub id: u32,
    pub name: String,
    pub created_at: u64,
    pub accumulators: Vec<AccumulatorManifest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorManifest {
    pub index: u32,
    pub kind: AccumulatorType,
    pub value: i64,
}

// =============================================================================
// File Naming
// =============================================================================

pub fn snapshot_path(dir: &Path, timestamp: u64) -> PathBuf {
    dir.join(format!("{}{:012}{}", FILE_PREFIX, timestamp, FILE_SUFFIX))
}

pub(crate) fn temp_snapshot_path(dir: &Path, timestamp: u64) -> PathBuf {
    dir.join(format!("{}{:012}{}.tmp", FILE_PREFIX, timestamp, FILE_SUFFIX))
}

fn parse_timestamp(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Complete checkpoint images in `dir`, oldest first
pub fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(timestamp) = parse_timestamp(&path) {
            found.push((timestamp, path));
        }
    }
    found.sort_by_key(|(timestamp, _)| *timestamp);
    Ok(found)
}

/// Delete images older than `keep`, and leftover temporary files.
/// Returns the number of files removed.
pub fn delete_older_than(dir: &Path, keep: u64) -> Result<usize> {
    let mut deleted = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let stale = match parse_timestamp(&path) {
            Some(timestamp) => timestamp < keep,
            None => path.extension().is_some_and(|ext| ext == "tmp"),
        };
        if stale {
            fs::remove_file(&path)?;
            deleted += 1;
        }
    }
    Ok(deleted)
}
