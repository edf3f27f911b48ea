//! Transaction Status
//!
//! Per-transaction state shared between the owning thread (the only writer)
//! and every thread asking visibility or conflict questions about it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{KeelError, Result};

/// Lifecycle of a transaction
///
/// ```text
/// Active ──► Committing ──► Committed
///   │            │
///   └────────────┴────────► Aborted | TimedOut
/// ```
///
/// `Committing` holds an allocated commit timestamp whose Commit record is not
/// yet durable. It is never reported as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
    TimedOut,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted | TxnState::TimedOut)
    }

    /// Aborted and timed out transactions are equivalent for visibility
    pub fn is_aborted(self) -> bool {
        matches!(self, TxnState::Aborted | TxnState::TimedOut)
    }
}

/// Terminal outcome passed to `TransactionIndex::notify_completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Committed,
    Aborted,
    TimedOut,
}

#[derive(Debug)]
struct StatusCell {
    state: TxnState,
    commit_ts: u64,
    completed_at: u64,
}

/// Status of one transaction, identified by its start timestamp
#[derive(Debug)]
pub struct TransactionStatus {
    ts: u64,
    cell: Mutex<StatusCell>,
    resolved: Condvar,
    step: AtomicU8,
    mvv_count: AtomicU64,
}

impl TransactionStatus {
    pub(crate) fn new(ts: u64) -> Self {
        Self {
            ts,
            cell: Mutex::new(StatusCell {
                state: TxnState::Active,
                commit_ts: 0,
                completed_at: 0,
            }),
            resolved: Condvar::new(),
            step: AtomicU8::new(0),
            mvv_count: AtomicU64::new(0),
        }
    }

    /// Start timestamp, which doubles as the transaction id
    pub fn ts(&self) -> u64 {
        self.ts
    }

    pub fn state(&self) -> TxnState {
        self.cell.lock().state
    }

    /// Commit timestamp once terminal and committed
    pub fn commit_ts(&self) -> Option<u64> {
        let cell = self.cell.lock();
        (cell.state == TxnState::Committed).then_some(cell.commit_ts)
    }

    /// State together with the commit timestamp (pending or final)
    pub fn outcome(&self) -> (TxnState, u64) {
        let cell = self.cell.lock();
        (cell.state, cell.commit_ts)
    }

    /// Timestamp at which the transaction stopped mattering to new readers
    pub fn completed_at(&self) -> u64 {
        self.cell.lock().completed_at
    }

    // -------------------------------------------------------------------------
    // Step
    // -------------------------------------------------------------------------

    pub fn step(&self) -> u8 {
        self.step.load(Ordering::Acquire)
    }

    pub(crate) fn increment_step(&self) -> Result<u8> {
        let current = self.step.load(Ordering::Acquire);
        let next = current.checked_add(1).ok_or_else(|| {
            KeelError::InvalidState(format!("transaction {} exhausted its steps", self.ts))
        })?;
        self.step.store(next, Ordering::Release);
        Ok(next)
    }

    // -------------------------------------------------------------------------
    // MVV Count
    // -------------------------------------------------------------------------

    /// Number of versions this transaction still has in page records
    pub fn mvv_count(&self) -> u64 {
        self.mvv_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_mvv_count(&self) {
        self.mvv_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the remaining count; never underflows
    pub(crate) fn decrement_mvv_count(&self) -> u64 {
        let previous = self
            .mvv_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    // -------------------------------------------------------------------------
    // Transitions (owner thread only)
    // -------------------------------------------------------------------------

    pub(crate) fn begin_commit(&self, commit_ts: u64) -> Result<()> {
        let mut cell = self.cell.lock();
        if cell.state != TxnState::Active {
            return Err(KeelError::InvalidState(format!(
                "transaction {} cannot commit from {:?}",
                self.ts, cell.state
            )));
        }
        cell.state = TxnState::Committing;
        cell.commit_ts = commit_ts;
        Ok(())
    }

    pub(crate) fn complete(&self, completion: Completion, at: u64) -> Result<()> {
        let mut cell = self.cell.lock();
        let next = match (cell.state, completion) {
            (TxnState::Committing, Completion::Committed) => TxnState::Committed,
            (TxnState::Active | TxnState::Committing, Completion::Aborted) => TxnState::Aborted,
            (TxnState::Active | TxnState::Committing, Completion::TimedOut) => TxnState::TimedOut,
            (state, completion) => {
                return Err(KeelError::InvalidState(format!(
                    "transaction {} cannot complete as {:?} from {:?}",
                    self.ts, completion, state
                )));
            }
        };
        cell.state = next;
        if next.is_aborted() {
            cell.commit_ts = 0;
        }
        cell.completed_at = at;
        drop(cell);
        self.resolved.notify_all();
        Ok(())
    }

    /// Install a terminal committed state directly (recovery only)
    pub(crate) fn restore_committed(&self, commit_ts: u64, at: u64) {
        let mut cell = self.cell.lock();
        cell.state = TxnState::Committed;
        cell.commit_ts = commit_ts;
        cell.completed_at = at;
        drop(cell);
        self.resolved.notify_all();
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Block until terminal or `timeout` elapses; returns the state observed
    pub fn wait_resolved(&self, timeout: Duration) -> TxnState {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell.lock();
        while !cell.state.is_terminal() {
            if self.resolved.wait_until(&mut cell, deadline).timed_out() {
                break;
            }
        }
        cell.state
    }
}
