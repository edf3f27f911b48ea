//! What recovery found in the journal and what it will replay

use std::path::PathBuf;

use crate::accumulator::AccumulatorType;
use crate::journal::JournalRecord;

/// One update of a committed transaction, applied at replay through the
/// same write paths live transactions use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOp {
    Store {
        tree_id: u32,
        step: u8,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// AntiValues for exactly the keys the transaction removed; the range
    /// is not evaluated again
    RemoveRange {
        tree_id: u32,
        step: u8,
        keys: Vec<Vec<u8>>,
    },
    RemoveTree {
        tree_id: u32,
    },
    AccumulatorDelta {
        tree_id: u32,
        index: u32,
        kind: AccumulatorType,
        value: i64,
    },
}

impl ReplayOp {
    /// The replayable part of a journal record; `None` for transaction
    /// control and non-transactional records
    pub fn from_record(record: JournalRecord) -> Option<Self> {
        match record {
            JournalRecord::Store {
                tree_id,
                step,
                key,
                value,
            } => Some(ReplayOp::Store {
                tree_id,
                step,
                key,
                value,
            }),
            JournalRecord::RemoveRange {
                tree_id, step, keys, ..
            } => Some(ReplayOp::RemoveRange {
                tree_id,
                step,
                keys,
            }),
            JournalRecord::RemoveTree { tree_id } => Some(ReplayOp::RemoveTree { tree_id }),
            JournalRecord::AccumulatorDelta {
                tree_id,
                index,
                kind,
                value,
            } => Some(ReplayOp::AccumulatorDelta {
                tree_id,
                index,
                kind,
                value,
            }),
            JournalRecord::BeginTransaction { .. }
            | JournalRecord::CreateTree { .. }
            | JournalRecord::Commit { .. }
            | JournalRecord::Rollback
            | JournalRecord::Checkpoint { .. } => None,
        }
    }

    pub fn tree_id(&self) -> u32 {
        match self {
            ReplayOp::Store { tree_id, .. }
            | ReplayOp::RemoveRange { tree_id, .. }
            | ReplayOp::RemoveTree { tree_id }
            | ReplayOp::AccumulatorDelta { tree_id, .. } => *tree_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReplayOp::Store { .. } => "Store",
            ReplayOp::RemoveRange { .. } => "RemoveRange",
            ReplayOp::RemoveTree { .. } => "RemoveTree",
            ReplayOp::AccumulatorDelta { .. } => "AccumulatorDelta",
        }
    }
}

/// A transaction reassembled from its journal records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTransaction {
    pub start_ts: u64,
    pub start_address: u64,
    pub commit_ts: Option<u64>,
    pub end_address: Option<u64>,
    pub rolled_back: bool,
    /// Updates with the address of the record each came from
    pub ops: Vec<(u64, ReplayOp)>,
}

impl RecoveredTransaction {
    pub(crate) fn new(start_ts: u64, start_address: u64) -> Self {
        Self {
            start_ts,
            start_address,
            commit_ts: None,
            end_address: None,
            rolled_back: false,
            ops: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.commit_ts.is_some() || self.rolled_back
    }
}

/// A tree created after the checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTree {
    pub tree_id: u32,
    pub timestamp: u64,
    pub name: String,
    pub address: u64,
}

/// The checkpoint recovery starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub timestamp: u64,
    pub base_address: u64,
    pub address: u64,
}

/// Counters reported by a recovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub checkpoint_timestamp: u64,
    pub base_address: u64,
    pub end_address: u64,
    pub records_scanned: u64,
    /// Records below the base address, already covered by the image
    pub records_below_base: u64,
    /// Transactions replayed
    pub committed_transactions: u64,
    /// Committed at or before the checkpoint, so already in the image
    pub checkpointed_transactions: u64,
    /// No Commit record; discarded
    pub uncommitted_transactions: u64,
    pub rolled_back_transactions: u64,
    pub trees_created: u64,
    pub applied_updates: u64,
    pub ignored_updates: u64,
    /// Updates that could not be applied, e.g. to a tree removed meanwhile
    pub failed_updates: u64,
    pub torn_tail: bool,
    pub truncated_bytes: u64,
}

/// Everything recovery needs to rebuild the engine
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    pub checkpoint: Option<CheckpointRecord>,
    /// Image holding the state as of the checkpoint timestamp
    pub image: Option<PathBuf>,
    /// Trees created after the checkpoint, in journal order
    pub trees: Vec<RecoveredTree>,
    /// Committed transactions to replay, in commit timestamp order
    pub transactions: Vec<RecoveredTransaction>,
    /// Highest timestamp mentioned anywhere in the journal
    pub max_timestamp: u64,
    pub max_tree_id: u32,
    pub stats: RecoveryStats,
}

impl RecoveryPlan {
    pub fn checkpoint_timestamp(&self) -> u64 {
        self.checkpoint.map_or(0, |c| c.timestamp)
    }

    pub fn update_count(&self) -> usize {
        self.transactions.iter().map(|t| t.ops.len()).sum()
    }
}
