//! Transaction Module
//!
//! Timestamps, per-transaction status and the index that answers visibility
//! and write-write dependency questions.
//!
//! ## Responsibilities
//! - Issue strictly increasing timestamps
//! - Track each transaction from begin to its terminal state
//! - Decide version visibility for snapshot isolation
//! - Block conflicting writers and break deadlock cycles
//! - Age out statuses no reader can depend on

mod deadlock;
mod index;
mod status;
mod timestamp;

pub use deadlock::WaitForGraph;
pub use index::{
    ActiveTransactionCache, CleanupResult, CommitStatus, IndexCounts, TransactionIndex,
    WwDependency,
};
pub use status::{Completion, TransactionStatus, TxnState};
pub use timestamp::TimestampAllocator;
