//! Recovery Manager
//!
//! Reads the journal left by the previous run and turns it into a
//! `RecoveryPlan`. Replay itself is done by the engine, which owns the
//! write paths.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{KeelError, Result};
use crate::journal::{JournalEntry, JournalReader, JournalRecord, JournalScan, NO_TRANSACTION};
use crate::snapshot::snapshot_path;

use super::plan::{
    CheckpointRecord, RecoveredTransaction, RecoveredTree, RecoveryPlan, RecoveryStats, ReplayOp,
};

/// Phase of a recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Reading journal files
    Scan,
    /// Building the transaction map
    Plan,
    /// The engine is applying committed transactions
    Replay,
    Done,
}

/// Drives one recovery through its phases
pub struct RecoveryManager {
    journal_dir: PathBuf,
    checkpoint_dir: PathBuf,
    state: RecoveryState,
    scan: Option<JournalScan>,
    stats: RecoveryStats,
}

impl RecoveryManager {
    pub fn new(journal_dir: &Path, checkpoint_dir: &Path) -> Self {
        Self {
            journal_dir: journal_dir.to_path_buf(),
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            state: RecoveryState::Scan,
            scan: None,
            stats: RecoveryStats::default(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Scan, drop a torn tail, and plan
    pub fn recover(&mut self) -> Result<RecoveryPlan> {
        self.scan()?;
        self.truncate_torn_tail()?;
        self.plan()
    }

    /// SCAN: read every journal file
    pub fn scan(&mut self) -> Result<&JournalScan> {
        self.expect_state(RecoveryState::Scan)?;
        let scan = if self.journal_dir.exists() {
            JournalReader::scan(&self.journal_dir)?
        } else {
            JournalScan::default()
        };
        self.stats.records_scanned = scan.entries.len() as u64;
        self.stats.end_address = scan.end_address;
        self.stats.torn_tail = scan.torn_tail.is_some();
        debug!(
            files = scan.generations.len(),
            records = scan.entries.len(),
            end = scan.end_address,
            "journal scanned"
        );
        self.state = RecoveryState::Plan;
        Ok(self.scan.insert(scan))
    }

    /// Cut the last file back to its readable prefix. Returns the number of
    /// bytes removed.
    pub fn truncate_torn_tail(&mut self) -> Result<u64> {
        let Some(torn) = self.scan.as_ref().and_then(|s| s.torn_tail.clone()) else {
            return Ok(0);
        };
        let file = OpenOptions::new().write(true).open(&torn.path)?;
        let before = file.metadata()?.len();
        file.set_len(torn.valid_len)?;
        file.sync_all()?;
        let removed = before.saturating_sub(torn.valid_len);
        warn!(
            path = %torn.path.display(),
            address = torn.stop.address,
            removed,
            "truncated torn journal tail"
        );
        self.stats.truncated_bytes = removed;
        Ok(removed)
    }

    /// PLAN: find the last checkpoint, reassemble transactions written at or
    /// after its base address, and order the committed ones for replay
    pub fn plan(&mut self) -> Result<RecoveryPlan> {
        self.expect_state(RecoveryState::Plan)?;
        let scan = self
            .scan
            .take()
            .ok_or_else(|| KeelError::InvalidState("recovery plan before scan".into()))?;

        let checkpoint = last_checkpoint(&scan.entries);
        let (timestamp, base) = checkpoint.map_or((0, 0), |c| (c.timestamp, c.base_address));
        self.stats.checkpoint_timestamp = timestamp;
        self.stats.base_address = base;

        if let (Some(&first), Some(block_size)) = (scan.generations.first(), scan.block_size) {
            let first_address = first * block_size;
            if base < first_address {
                return Err(KeelError::corruption(
                    base,
                    format!(
                        "journal starts at generation {} but recovery needs address {}",
                        first, base
                    ),
                ));
            }
        }

        let image = match checkpoint {
            Some(c) => {
                let path = snapshot_path(&self.checkpoint_dir, c.timestamp);
                if !path.exists() {
                    return Err(KeelError::corruption(
                        c.address,
                        format!("checkpoint image {} is missing", path.display()),
                    ));
                }
                Some(path)
            }
            None => None,
        };

        let mut builder = PlanBuilder {
            checkpoint_ts: timestamp,
            txns: BTreeMap::new(),
            trees: Vec::new(),
            max_timestamp: timestamp,
            max_tree_id: 0,
            stats: &mut self.stats,
        };
        for entry in scan.entries {
            if entry.address < base {
                builder.stats.records_below_base += 1;
                builder.note_below_base(&entry);
                continue;
            }
            builder.add(entry)?;
        }
        let PlanBuilder {
            txns,
            trees,
            max_timestamp,
            max_tree_id,
            ..
        } = builder;

        let mut transactions = Vec::new();
        for (_, txn) in txns {
            let ops = txn.ops.len() as u64;
            match (txn.rolled_back, txn.commit_ts) {
                (true, _) => {
                    self.stats.rolled_back_transactions += 1;
                    self.stats.ignored_updates += ops;
                }
                (false, None) => {
                    self.stats.uncommitted_transactions += 1;
                    self.stats.ignored_updates += ops;
                }
                (false, Some(tc)) if tc <= timestamp => {
                    self.stats.checkpointed_transactions += 1;
                    self.stats.ignored_updates += ops;
                }
                (false, Some(_)) => transactions.push(txn),
            }
        }
        transactions.sort_by_key(|t| t.commit_ts);
        self.stats.committed_transactions = transactions.len() as u64;
        self.stats.trees_created = trees.len() as u64;

        info!(
            checkpoint = timestamp,
            base,
            replay = transactions.len(),
            uncommitted = self.stats.uncommitted_transactions,
            rolled_back = self.stats.rolled_back_transactions,
            "recovery plan ready"
        );
        self.state = RecoveryState::Replay;
        Ok(RecoveryPlan {
            checkpoint,
            image,
            trees,
            transactions,
            max_timestamp,
            max_tree_id,
            stats: self.stats.clone(),
        })
    }

    /// DONE: record the replay outcome
    pub fn finish(&mut self, stats: &RecoveryStats) -> Result<()> {
        self.expect_state(RecoveryState::Replay)?;
        self.stats = stats.clone();
        self.state = RecoveryState::Done;
        info!(
            committed = stats.committed_transactions,
            applied = stats.applied_updates,
            ignored = stats.ignored_updates,
            failed = stats.failed_updates,
            "recovery complete"
        );
        Ok(())
    }

    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    fn expect_state(&self, expected: RecoveryState) -> Result<()> {
        if self.state != expected {
            return Err(KeelError::InvalidState(format!(
                "recovery is in {:?}, expected {:?}",
                self.state, expected
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Plan Building
// =============================================================================

fn last_checkpoint(entries: &[JournalEntry]) -> Option<CheckpointRecord> {
    entries.iter().rev().find_map(|e| match e.record {
        JournalRecord::Checkpoint {
            timestamp,
            base_address,
        } => Some(CheckpointRecord {
            timestamp,
            base_address,
            address: e.address,
        }),
        _ => None,
    })
}

struct PlanBuilder<'a> {
    checkpoint_ts: u64,
    txns: BTreeMap<u64, RecoveredTransaction>,
    trees: Vec<RecoveredTree>,
    max_timestamp: u64,
    max_tree_id: u32,
    stats: &'a mut RecoveryStats,
}

impl PlanBuilder<'_> {
    /// Records below the base still bound the timestamps and tree ids the
    /// engine may hand out next
    fn note_below_base(&mut self, entry: &JournalEntry) {
        match &entry.record {
            JournalRecord::BeginTransaction { start_ts } => self.see_timestamp(*start_ts),
            JournalRecord::Commit { commit_ts } => self.see_timestamp(*commit_ts),
            JournalRecord::CreateTree {
                tree_id, timestamp, ..
            } => {
                self.see_timestamp(*timestamp);
                self.max_tree_id = self.max_tree_id.max(*tree_id);
            }
            _ => {}
        }
    }

    fn add(&mut self, entry: JournalEntry) -> Result<()> {
        let JournalEntry {
            address,
            txn_id,
            record,
        } = entry;

        match record {
            JournalRecord::Checkpoint { timestamp, .. } => {
                self.see_timestamp(timestamp);
            }
            JournalRecord::CreateTree {
                tree_id,
                timestamp,
                name,
            } => {
                if txn_id != NO_TRANSACTION {
                    return Err(KeelError::corruption(
                        address,
                        format!("CreateTree inside transaction {}", txn_id),
                    ));
                }
                self.see_timestamp(timestamp);
                self.max_tree_id = self.max_tree_id.max(tree_id);
                // Trees that existed at the checkpoint come from the image
                if timestamp > self.checkpoint_ts {
                    self.trees.push(RecoveredTree {
                        tree_id,
                        timestamp,
                        name,
                        address,
                    });
                }
            }
            JournalRecord::BeginTransaction { start_ts } => {
                if txn_id != start_ts {
                    return Err(KeelError::corruption(
                        address,
                        format!("Begin for {} names start timestamp {}", txn_id, start_ts),
                    ));
                }
                if self.txns.contains_key(&txn_id) {
                    return Err(KeelError::corruption(
                        address,
                        format!("second Begin for transaction {}", txn_id),
                    ));
                }
                self.see_timestamp(start_ts);
                self.txns
                    .insert(txn_id, RecoveredTransaction::new(start_ts, address));
            }
            JournalRecord::Commit { commit_ts } => {
                self.see_timestamp(commit_ts);
                let Some(txn) = self.open_transaction(txn_id, address, "Commit")? else {
                    return Ok(());
                };
                if commit_ts <= txn.start_ts {
                    return Err(KeelError::corruption(
                        address,
                        format!(
                            "commit timestamp {} not after start {}",
                            commit_ts, txn.start_ts
                        ),
                    ));
                }
                txn.commit_ts = Some(commit_ts);
                txn.end_address = Some(address);
            }
            JournalRecord::Rollback => {
                if txn_id == NO_TRANSACTION {
                    return Err(KeelError::corruption(
                        address,
                        "Rollback record without a transaction",
                    ));
                }
                // A Rollback may follow a Commit whose sync failed; it wins
                match self.txns.get_mut(&txn_id) {
                    None => {}
                    Some(txn) if txn.rolled_back => {
                        return Err(KeelError::corruption(
                            address,
                            format!("second Rollback for transaction {}", txn_id),
                        ));
                    }
                    Some(txn) => {
                        txn.rolled_back = true;
                        txn.end_address = Some(address);
                    }
                }
            }
            other => {
                let name = other.name();
                let Some(op) = ReplayOp::from_record(other) else {
                    return Ok(());
                };
                self.max_tree_id = self.max_tree_id.max(op.tree_id());
                match self.open_transaction(txn_id, address, name)? {
                    Some(txn) => txn.ops.push((address, op)),
                    None => self.stats.ignored_updates += 1,
                }
            }
        }
        Ok(())
    }

    /// The unfinished transaction `txn_id`. `None` when its Begin lies
    /// below the base address, so it finished before the checkpoint.
    fn open_transaction(
        &mut self,
        txn_id: u64,
        address: u64,
        what: &str,
    ) -> Result<Option<&mut RecoveredTransaction>> {
        if txn_id == NO_TRANSACTION {
            return Err(KeelError::corruption(
                address,
                format!("{} record without a transaction", what),
            ));
        }
        match self.txns.get_mut(&txn_id) {
            None => {
                debug!(txn_id, address, what, "record of a transaction begun before the base");
                Ok(None)
            }
            Some(txn) if txn.is_finished() => Err(KeelError::corruption(
                address,
                format!("{} after transaction {} finished", what, txn_id),
            )),
            Some(txn) => Ok(Some(txn)),
        }
    }

    fn see_timestamp(&mut self, ts: u64) {
        self.max_timestamp = self.max_timestamp.max(ts);
    }
}
