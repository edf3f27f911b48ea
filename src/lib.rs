//! # KeelKV
//!
//! A transactional key-value engine with:
//! - Snapshot isolation through multi-version values (MVCC)
//! - Write-write conflict detection with deadlock victim selection
//! - Transactional accumulators (sum, max, min, sequence)
//! - A write-ahead journal with group commit
//! - Checkpoints and crash recovery that replays committed work only
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Transactions                          │
//! │        store / fetch / remove / lock / accumulators         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  Transaction Index                          │
//! │   timestamps · status table · visibility · ww dependency    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Journal   │          │ Page Store  │
//!   │  (Append)   │          │ (MVV recs)  │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Recovery   │◄─────────┤ Checkpoint  │
//!   │  (Replay)   │          │   Images    │
//!   └─────────────┘          └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod txn;
pub mod mvv;
pub mod accumulator;
pub mod store;
pub mod journal;
pub mod snapshot;
pub mod recovery;
pub mod cleanup;
pub mod engine;
pub mod transaction;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use accumulator::AccumulatorType;
pub use cleanup::{CleanupPassStats, CleanupStatsSnapshot};
pub use config::{CommitPolicy, Config};
pub use engine::{Engine, EngineStatsSnapshot};
pub use error::{KeelError, Result};
pub use store::TreeId;
pub use transaction::{Transaction, TxnAccumulator};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of KeelKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
