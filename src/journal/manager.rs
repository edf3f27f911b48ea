//! Journal Manager
//!
//! Owns the current journal file, the map of transactions with records in
//! the journal, rollover, checkpoint records and commit durability.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CommitPolicy, Config};
use crate::error::{KeelError, Result};

use super::file::{is_temp_file, list_journal_files};
use super::record::{JournalEntry, JournalRecord, NO_TRANSACTION};
use super::writer::{sync_dir, JournalWriter};
use super::FILE_HEADER_SIZE;

/// A transaction with records in the journal that has not yet committed or
/// rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionMapItem {
    pub start_address: u64,
    pub start_ts: u64,
    pub last_record_address: u64,
}

/// Last checkpoint written by this manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub timestamp: u64,
    pub base_address: u64,
    pub address: u64,
}

/// Point-in-time copy of the journal counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStatsSnapshot {
    pub records_written: u64,
    pub bytes_written: u64,
    pub syncs: u64,
    pub rollovers: u64,
    pub files_deleted: u64,
    pub checkpoints: u64,
}

#[derive(Default)]
struct JournalStats {
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    syncs: AtomicU64,
    rollovers: AtomicU64,
    files_deleted: AtomicU64,
    checkpoints: AtomicU64,
}

struct JournalInner {
    writer: JournalWriter,
    live: HashMap<u64, TransactionMapItem>,
    last_checkpoint: Option<CheckpointInfo>,
}

/// The journal manager
///
/// ## Concurrency
/// - `inner`: one mutex serializes appends; record order is address order
/// - `sync_lock` + `synced_address`: commit fsyncs happen outside `inner`;
///   a committer whose address an earlier fsync already covered returns
///   without syncing again
pub struct JournalManager {
    dir: PathBuf,
    policy: CommitPolicy,
    buffer_size: usize,
    inner: Mutex<JournalInner>,
    sync_lock: Mutex<()>,
    synced_address: AtomicU64,
    stats: JournalStats,
}

impl JournalManager {
    /// Open the journal for writing, starting a fresh file after every
    /// existing generation. Call after recovery has read the old files.
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        fs::create_dir_all(dir)?;

        // Leftovers of an interrupted rollover
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if is_temp_file(&path) {
                warn!(path = %path.display(), "removing incomplete journal file");
                fs::remove_file(&path)?;
            }
        }

        let existing = list_journal_files(dir)?;
        let (generation, block_size) = match existing.last() {
            Some((last, path)) => {
                let block_size = super::JournalReader::read_file(path)?.header.block_size;
                if block_size != config.journal_block_size {
                    warn!(
                        recorded = block_size,
                        configured = config.journal_block_size,
                        "keeping the journal's recorded block size"
                    );
                }
                (last + 1, block_size)
            }
            None => (0, config.journal_block_size),
        };

        let writer =
            JournalWriter::create(dir, generation, block_size, config.journal_buffer_size)?;
        let start = writer.current_address();
        info!(generation, address = start, policy = ?config.commit_policy, "journal opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            policy: config.commit_policy,
            buffer_size: config.journal_buffer_size,
            inner: Mutex::new(JournalInner {
                writer,
                live: HashMap::new(),
                last_checkpoint: None,
            }),
            sync_lock: Mutex::new(()),
            synced_address: AtomicU64::new(start),
            stats: JournalStats::default(),
        })
    }

    // =========================================================================
    // Appending
    // =========================================================================

    /// Append a record for `txn_id` and return its address.
    ///
    /// Not durable on return; see `commit` and `force`.
    pub fn append(&self, txn_id: u64, record: JournalRecord) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.append_locked(&mut inner, txn_id, record)
    }

    /// Append the Commit record of `txn_id` and make it as durable as the
    /// commit policy demands before returning
    pub fn commit(&self, txn_id: u64, commit_ts: u64) -> Result<u64> {
        let address = self.append(txn_id, JournalRecord::Commit { commit_ts })?;
        if self.policy == CommitPolicy::Hard {
            self.sync_through(address)?;
        }
        Ok(address)
    }

    /// Append a Rollback record for a transaction that journaled something
    pub fn rollback(&self, txn_id: u64) -> Result<u64> {
        self.append(txn_id, JournalRecord::Rollback)
    }

    /// Flush and fsync everything appended so far
    pub fn force(&self) -> Result<()> {
        let end = self.current_address();
        self.sync_through(end)
    }

    /// Close the current file and continue in the next generation.
    ///
    /// On failure the current file stays in use and nothing written is lost;
    /// the call can be retried.
    pub fn rollover(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.rollover_locked(&mut inner)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Earliest address recovery still needs: the start of the oldest
    /// transaction without a Commit or Rollback record, or the current
    /// address when there is none
    pub fn base_address(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .live
            .values()
            .map(|item| item.start_address)
            .min()
            .unwrap_or_else(|| inner.writer.current_address())
    }

    /// Write a Checkpoint record, fsync it, then delete journal files that
    /// lie wholly below `base_address`
    pub fn checkpoint(&self, timestamp: u64, base_address: u64) -> Result<CheckpointInfo> {
        let address = self.append(
            NO_TRANSACTION,
            JournalRecord::Checkpoint {
                timestamp,
                base_address,
            },
        )?;
        self.sync_through(address)?;

        let info = CheckpointInfo {
            timestamp,
            base_address,
            address,
        };
        let current_generation = {
            let mut inner = self.inner.lock();
            inner.last_checkpoint = Some(info);
            inner.writer.generation()
        };
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);

        let deleted = self.delete_files_below(base_address, current_generation, self.block_size())?;
        info!(timestamp, base_address, address, deleted, "checkpoint written");
        Ok(info)
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointInfo> {
        self.inner.lock().last_checkpoint
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn current_address(&self) -> u64 {
        self.inner.lock().writer.current_address()
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.lock().writer.generation()
    }

    pub fn block_size(&self) -> u64 {
        self.inner.lock().writer.block_size()
    }

    pub fn synced_address(&self) -> u64 {
        self.synced_address.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> CommitPolicy {
        self.policy
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn live_transaction(&self, txn_id: u64) -> Option<TransactionMapItem> {
        self.inner.lock().live.get(&txn_id).copied()
    }

    pub fn live_transaction_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Generations of the journal files currently on disk
    pub fn file_generations(&self) -> Result<Vec<u64>> {
        Ok(list_journal_files(&self.dir)?
            .into_iter()
            .map(|(generation, _)| generation)
            .collect())
    }

    pub fn stats(&self) -> JournalStatsSnapshot {
        JournalStatsSnapshot {
            records_written: self.stats.records_written.load(Ordering::Relaxed),
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            syncs: self.stats.syncs.load(Ordering::Relaxed),
            rollovers: self.stats.rollovers.load(Ordering::Relaxed),
            files_deleted: self.stats.files_deleted.load(Ordering::Relaxed),
            checkpoints: self.stats.checkpoints.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn append_locked(
        &self,
        inner: &mut JournalInner,
        txn_id: u64,
        record: JournalRecord,
    ) -> Result<u64> {
        let mut entry = JournalEntry::new(inner.writer.current_address(), txn_id, record);
        let mut len = entry.serialize().len();

        if !inner.writer.fits(len) {
            if len as u64 > inner.writer.block_size() - FILE_HEADER_SIZE {
                return Err(KeelError::Durability(format!(
                    "{} record of {} bytes exceeds the journal block size",
                    entry.record.name(),
                    len
                )));
            }
            self.rollover_locked(inner)?;
            entry.address = inner.writer.current_address();
            len = entry.serialize().len();
        }

        let bytes = entry.serialize();
        debug_assert_eq!(bytes.len(), len);
        let address = inner
            .writer
            .append(&bytes)
            .map_err(|e| KeelError::Durability(format!("journal append failed: {}", e)))?;

        self.stats.records_written.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Self::track(&mut inner.live, txn_id, &entry.record, address);
        Ok(address)
    }

    fn track(
        live: &mut HashMap<u64, TransactionMapItem>,
        txn_id: u64,
        record: &JournalRecord,
        address: u64,
    ) {
        if txn_id == NO_TRANSACTION {
            return;
        }
        match record {
            JournalRecord::BeginTransaction { start_ts } => {
                live.insert(
                    txn_id,
                    TransactionMapItem {
                        start_address: address,
                        start_ts: *start_ts,
                        last_record_address: address,
                    },
                );
            }
            JournalRecord::Commit { .. } | JournalRecord::Rollback => {
                live.remove(&txn_id);
            }
            _ => {
                if let Some(item) = live.get_mut(&txn_id) {
                    item.last_record_address = address;
                }
            }
        }
    }

    fn rollover_locked(&self, inner: &mut JournalInner) -> Result<()> {
        inner.writer.sync().map_err(|e| {
            KeelError::Durability(format!("journal sync before rollover failed: {}", e))
        })?;
        let synced = inner.writer.current_address();
        self.synced_address.fetch_max(synced, Ordering::AcqRel);

        let next = JournalWriter::create(
            &self.dir,
            inner.writer.generation() + 1,
            inner.writer.block_size(),
            self.buffer_size,
        )
        .map_err(|e| KeelError::Durability(format!("journal rollover failed: {}", e)))?;

        debug!(
            from = inner.writer.generation(),
            to = next.generation(),
            live = inner.live.len(),
            "journal rollover"
        );
        inner.writer = next;
        self.stats.rollovers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// fsync so that every byte below `address` is durable. Concurrent
    /// callers share one fsync.
    fn sync_through(&self, address: u64) -> Result<()> {
        if self.synced_address.load(Ordering::Acquire) > address {
            return Ok(());
        }
        let _sync = self.sync_lock.lock();
        if self.synced_address.load(Ordering::Acquire) > address {
            return Ok(());
        }

        let (file, end): (File, u64) = {
            let mut inner = self.inner.lock();
            inner
                .writer
                .flush()
                .map_err(|e| KeelError::Durability(format!("journal flush failed: {}", e)))?;
            (inner.writer.file_handle()?, inner.writer.current_address())
        };
        file.sync_data()
            .map_err(|e| KeelError::Durability(format!("journal fsync failed: {}", e)))?;

        self.synced_address.fetch_max(end, Ordering::AcqRel);
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete_files_below(
        &self,
        base_address: u64,
        current_generation: u64,
        block_size: u64,
    ) -> Result<usize> {
        let mut deleted = 0;
        for (generation, path) in list_journal_files(&self.dir)? {
            if generation >= current_generation || (generation + 1) * block_size > base_address {
                continue;
            }
            fs::remove_file(&path)?;
            deleted += 1;
            debug!(generation, "deleted obsolete journal file");
        }
        if deleted > 0 {
            sync_dir(&self.dir)?;
            self.stats.files_deleted.fetch_add(deleted as u64, Ordering::Relaxed);
        }
        Ok(deleted)
    }
}
