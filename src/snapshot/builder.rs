//! Snapshot Builder
//!
//! Writes a checkpoint image under a temporary name and renames it into
//! place once complete.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{KeelError, Result};
use crate::journal::sync_dir;

use super::{
    snapshot_path, temp_snapshot_path, SnapshotManifest, HEADER_SIZE, MAGIC, VERSION,
};

/// Builder for one checkpoint image
pub struct SnapshotBuilder {
    dir: PathBuf,
    timestamp: u64,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    entry_count: u64,
    current_offset: u64,
    /// Last (tree, key) written; entries must arrive in order
    last: Option<(u32, Vec<u8>)>,
    hasher: crc32fast::Hasher,
}

impl SnapshotBuilder {
    /// Start the image for `timestamp` in `dir`.
    ///
    /// Writes the header immediately; call `add()` in (tree, key) order, then
    /// `finish()`.
    pub fn new(dir: &Path, timestamp: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let tmp_path = temp_snapshot_path(dir, timestamp);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&timestamp.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?; // entry count, patched in finish

        Ok(Self {
            dir: dir.to_path_buf(),
            timestamp,
            tmp_path,
            writer,
            entry_count: 0,
            current_offset: HEADER_SIZE,
            last: None,
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// Add one visible key value
    pub fn add(&mut self, tree_id: u32, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some((last_tree, last_key)) = &self.last {
            if (tree_id, key) <= (*last_tree, last_key.as_slice()) {
                return Err(KeelError::InvalidState(format!(
                    "checkpoint entries out of order at tree {}",
                    tree_id
                )));
            }
        }

        let tree_bytes = tree_id.to_le_bytes();
        let key_len = (key.len() as u32).to_le_bytes();
        let val_len = (value.len() as u32).to_le_bytes();
        for part in [&tree_bytes[..], &key_len[..], &val_len[..], key, value] {
            self.writer.write_all(part)?;
            self.hasher.update(part);
        }

        self.current_offset += (12 + key.len() + value.len()) as u64;
        self.entry_count += 1;
        self.last = Some((tree_id, key.to_vec()));
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Write the manifest and footer, fsync, and rename into place.
    /// Returns the final path.
    pub fn finish(mut self, manifest: &SnapshotManifest) -> Result<PathBuf> {
        if manifest.timestamp != self.timestamp {
            return Err(KeelError::InvalidState(format!(
                "manifest timestamp {} does not match image {}",
                manifest.timestamp, self.timestamp
            )));
        }
        let manifest_offset = self.current_offset;

        let body = bincode::serialize(manifest)?;
        let body_len = (body.len() as u32).to_le_bytes();
        self.writer.write_all(&body_len)?;
        self.writer.write_all(&body)?;
        self.hasher.update(&body_len);
        self.hasher.update(&body);

        let crc = self.hasher.finalize();
        self.writer.write_all(&manifest_offset.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&[0u8; 4])?;
        self.writer.flush()?;

        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| {
                KeelError::Durability(format!("failed to flush checkpoint image: {}", e))
            })?;
        file.seek(SeekFrom::Start(14))?; // after magic + version + timestamp
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        let path = snapshot_path(&self.dir, self.timestamp);
        fs::rename(&self.tmp_path, &path)?;
        sync_dir(&self.dir)?;

        debug!(
            timestamp = self.timestamp,
            entries = self.entry_count,
            trees = manifest.trees.len(),
            "checkpoint image written"
        );
        Ok(path)
    }
}
