//! Recovery Module
//!
//! Rebuilds engine state after a crash from the newest checkpoint image
//! and the journal written since.
//!
//! ## Phases
//! ```text
//!   SCAN ──► PLAN ──► REPLAY ──► DONE
//! ```
//! - **Scan**: read every journal file. An unreadable record in the last
//!   file is a torn tail and is truncated away; one in an earlier file is
//!   corruption and stops recovery.
//! - **Plan**: locate the last Checkpoint record, reassemble transactions
//!   from records at or after its base address, and keep those committed
//!   after the checkpoint timestamp, ordered by commit timestamp.
//! - **Replay**: the engine loads the image, then applies each planned
//!   transaction with its original timestamps.
//!
//! Transactions without a Commit record, or with a Rollback record, are
//! discarded.

mod manager;
mod plan;

pub use manager::{RecoveryManager, RecoveryState};
pub use plan::{
    CheckpointRecord, RecoveredTransaction, RecoveredTree, RecoveryPlan, RecoveryStats, ReplayOp,
};
