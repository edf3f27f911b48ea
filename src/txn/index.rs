//! Transaction Index
//!
//! Maps a start timestamp to its `TransactionStatus` and answers the two
//! questions everything else asks: "is version V visible to T" and "must
//! writer A wait for, or yield to, writer B".
//!
//! ## Concurrency
//! - Statuses live in lock-striped shards keyed by start timestamp; there is
//!   no global lock on the read path.
//! - Statuses are `Arc`-shared. Aging out removes the table's reference;
//!   owners and waiters keep theirs until they drop them.
//! - Commit timestamps are allocated under `commit_lock`, so commit order is
//!   a total order and checkpoints observe every earlier commit as in flight
//!   or finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::mvv::handle::{vh_to_step, vh_to_ts, ABORTED, PRIMORDIAL, UNCOMMITTED};

use super::deadlock::WaitForGraph;
use super::status::{Completion, TransactionStatus, TxnState};
use super::timestamp::TimestampAllocator;

/// How long a blocked writer sleeps before re-checking for deadlock
const DEADLOCK_POLL: Duration = Duration::from_millis(10);

/// Slice used while waiting for an in-flight commit to become terminal
const COMMIT_POLL: Duration = Duration::from_millis(50);

/// Visibility of one version to one observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Owner is active, or committed after the observer's snapshot
    Uncommitted,
    /// Owner committed at the given timestamp (0 for primordial)
    Committed(u64),
    /// Owner aborted or timed out; the version can always be discarded
    Aborted,
}

impl CommitStatus {
    pub fn is_visible(self) -> bool {
        matches!(self, CommitStatus::Committed(_))
    }

    /// Timestamp form, using the reserved sentinels for the other outcomes
    pub fn as_timestamp(self) -> u64 {
        match self {
            CommitStatus::Uncommitted => UNCOMMITTED,
            CommitStatus::Committed(tc) => tc,
            CommitStatus::Aborted => ABORTED,
        }
    }
}

/// Result of a write-write dependency check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WwDependency {
    /// No conflict; the caller may write
    None,
    /// The other writer committed after the caller started
    Conflict(u64),
    /// The other writer was still active when the budget ran out
    TimedOut,
    /// The caller is the youngest member of a wait cycle
    Deadlock,
}

/// Snapshot of which transactions were active at `ceiling`
#[derive(Debug, Clone, Default)]
pub struct ActiveTransactionCache {
    /// Allocator value when the snapshot was taken
    pub ceiling: u64,
    /// No transaction active at `ceiling` started below this timestamp
    pub floor: u64,
    /// Sorted start timestamps of transactions active at `ceiling`
    pub active: Vec<u64>,
}

/// Outcome of an aging-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupResult {
    pub committed_removed: usize,
    pub aborted_removed: usize,
    pub floor: u64,
}

/// Current occupancy of the status table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCounts {
    pub active: usize,
    pub committed: usize,
    pub aborted: usize,
}

#[derive(Default)]
struct Shard {
    statuses: HashMap<u64, Arc<TransactionStatus>>,
}

/// The transaction index
pub struct TransactionIndex {
    allocator: Arc<TimestampAllocator>,
    shards: Vec<Mutex<Shard>>,
    /// Readers: registration. Writer: reading the cache ceiling.
    registration: RwLock<()>,
    commit_lock: Mutex<()>,
    cache: RwLock<ActiveTransactionCache>,
    wait_graph: WaitForGraph,
}

impl TransactionIndex {
    pub fn new(allocator: Arc<TimestampAllocator>, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            allocator,
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            registration: RwLock::new(()),
            commit_lock: Mutex::new(()),
            cache: RwLock::new(ActiveTransactionCache::default()),
            wait_graph: WaitForGraph::new(),
        }
    }

    pub fn allocator(&self) -> &Arc<TimestampAllocator> {
        &self.allocator
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Allocate a start timestamp and register an active status
    pub fn begin(&self) -> Arc<TransactionStatus> {
        let _gate = self.registration.read();
        let ts = self.allocator.allocate();
        let status = Arc::new(TransactionStatus::new(ts));
        self.shard(ts).lock().statuses.insert(ts, Arc::clone(&status));
        trace!(ts, "transaction registered");
        status
    }

    /// Register a transaction read back from the journal under its original
    /// start timestamp
    pub fn register_recovered(&self, ts: u64) -> Arc<TransactionStatus> {
        let _gate = self.registration.read();
        self.allocator.advance_to(ts);
        let status = Arc::new(TransactionStatus::new(ts));
        self.shard(ts).lock().statuses.insert(ts, Arc::clone(&status));
        status
    }

    /// Mark a recovered transaction committed at its original commit timestamp
    pub fn complete_recovered(&self, status: &TransactionStatus, commit_ts: u64) {
        self.allocator.advance_to(commit_ts);
        let at = self.allocator.update_timestamp();
        status.restore_committed(commit_ts, at);
    }

    pub fn get(&self, ts: u64) -> Option<Arc<TransactionStatus>> {
        self.shard(ts).lock().statuses.get(&ts).cloned()
    }

    // =========================================================================
    // Commit Ordering
    // =========================================================================

    /// Allocate the commit timestamp and move the status to `Committing`
    pub fn start_commit(&self, status: &TransactionStatus) -> Result<u64> {
        let _commit = self.commit_lock.lock();
        let commit_ts = self.allocator.allocate();
        status.begin_commit(commit_ts)?;
        Ok(commit_ts)
    }

    /// Register a read-only reader whose start timestamp is ordered against
    /// every commit timestamp: any commit below it is already `Committing`
    /// or terminal. While it stays active nothing it can see is pruned or
    /// folded away.
    pub fn begin_checkpoint(&self) -> Arc<TransactionStatus> {
        let _commit = self.commit_lock.lock();
        self.begin()
    }

    /// Record the terminal outcome of a transaction
    pub fn notify_completed(
        &self,
        status: &TransactionStatus,
        completion: Completion,
        timestamp: u64,
    ) -> Result<()> {
        status.complete(completion, timestamp)?;
        self.wait_graph.remove_wait(status.ts());
        trace!(ts = status.ts(), ?completion, timestamp, "transaction completed");
        Ok(())
    }

    // =========================================================================
    // Visibility
    // =========================================================================

    /// Whether the version `vh` is visible to an observer with start
    /// timestamp `visible_to` at step `step`
    pub fn commit_status(&self, vh: u64, visible_to: u64, step: u8) -> CommitStatus {
        if vh == PRIMORDIAL {
            return CommitStatus::Committed(0);
        }
        let ts = vh_to_ts(vh);
        if ts == visible_to {
            return if vh_to_step(vh) <= step {
                CommitStatus::Committed(ts)
            } else {
                CommitStatus::Uncommitted
            };
        }

        // Aged out: committed before every active transaction began
        let Some(status) = self.get(ts) else {
            return CommitStatus::Committed(ts);
        };

        loop {
            let (state, commit_ts) = status.outcome();
            match state {
                TxnState::Active => return CommitStatus::Uncommitted,
                TxnState::Committing => {
                    if commit_ts > visible_to {
                        return CommitStatus::Uncommitted;
                    }
                    status.wait_resolved(COMMIT_POLL);
                }
                TxnState::Committed => {
                    return if commit_ts <= visible_to {
                        CommitStatus::Committed(commit_ts)
                    } else {
                        CommitStatus::Uncommitted
                    };
                }
                TxnState::Aborted | TxnState::TimedOut => return CommitStatus::Aborted,
            }
        }
    }

    /// Status of the writer of `vh` as of now, without blocking. An
    /// in-flight commit reports `Uncommitted`.
    pub fn peek_status(&self, vh: u64) -> CommitStatus {
        if vh == PRIMORDIAL {
            return CommitStatus::Committed(0);
        }
        let ts = vh_to_ts(vh);
        match self.get(ts).map(|status| status.outcome()) {
            None => CommitStatus::Committed(ts),
            Some((TxnState::Committed, commit_ts)) => CommitStatus::Committed(commit_ts),
            Some((TxnState::Aborted | TxnState::TimedOut, _)) => CommitStatus::Aborted,
            Some(_) => CommitStatus::Uncommitted,
        }
    }

    /// Write-write dependency of `status` on the writer of `vh`.
    ///
    /// Blocks up to `timeout` while that writer is active. Re-checks the
    /// wait-for graph every few milliseconds and returns `Deadlock` when the
    /// caller is the youngest member of a cycle.
    pub fn ww_dependency(
        &self,
        vh: u64,
        status: &TransactionStatus,
        timeout: Duration,
    ) -> WwDependency {
        let ts = vh_to_ts(vh);
        if vh == PRIMORDIAL || ts == status.ts() {
            return WwDependency::None;
        }
        let Some(other) = self.get(ts) else {
            return WwDependency::None;
        };

        let me = status.ts();
        let deadline = Instant::now() + timeout;
        let result = loop {
            let (state, commit_ts) = other.outcome();
            match state {
                TxnState::Committed => {
                    break if commit_ts > me {
                        WwDependency::Conflict(commit_ts)
                    } else {
                        WwDependency::None
                    };
                }
                TxnState::Aborted | TxnState::TimedOut => break WwDependency::None,
                TxnState::Active | TxnState::Committing => {
                    let now = Instant::now();
                    if now >= deadline {
                        break WwDependency::TimedOut;
                    }
                    if state == TxnState::Active {
                        self.wait_graph.add_wait(me, ts);
                        if let Some(cycle) = self.wait_graph.cycle_through(me) {
                            if WaitForGraph::choose_victim(&cycle) == me {
                                warn!(victim = me, ?cycle, "deadlock detected");
                                break WwDependency::Deadlock;
                            }
                        }
                    }
                    other.wait_resolved((deadline - now).min(DEADLOCK_POLL));
                }
            }
        };
        self.wait_graph.remove_wait(me);
        result
    }

    // =========================================================================
    // Active Transaction Cache
    // =========================================================================

    /// Recompute the floor and the set of active start timestamps
    pub fn update_active_transaction_cache(&self) -> ActiveTransactionCache {
        let ceiling = {
            let _gate = self.registration.write();
            self.allocator.current()
        };

        let mut active = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            active.extend(
                shard
                    .statuses
                    .iter()
                    .filter(|(ts, s)| **ts <= ceiling && !s.state().is_terminal())
                    .map(|(&ts, _)| ts),
            );
        }
        active.sort_unstable();

        let cache = ActiveTransactionCache {
            ceiling,
            floor: active.first().copied().unwrap_or(ceiling + 1),
            active,
        };
        *self.cache.write() = cache.clone();
        cache
    }

    pub fn active_transaction_cache(&self) -> ActiveTransactionCache {
        self.cache.read().clone()
    }

    /// Start timestamp below which no transaction was active at the last
    /// cache refresh
    pub fn floor(&self) -> u64 {
        self.cache.read().floor
    }

    /// Whether some transaction that may still read could have started in
    /// `[ts0, ts1)`. Conservative when `ts1` is newer than the cache.
    pub fn has_concurrent_transaction(&self, ts0: u64, ts1: u64) -> bool {
        let cache = self.cache.read();
        if ts1 > cache.ceiling {
            return true;
        }
        let start = cache.active.partition_point(|&ts| ts < ts0);
        cache.active.get(start).is_some_and(|&ts| ts < ts1)
    }

    /// Refresh the cache, then age out statuses nobody can depend on:
    /// committed below the floor, aborted with no versions left in pages
    pub fn cleanup(&self) -> CleanupResult {
        let cache = self.update_active_transaction_cache();
        let floor = cache.floor;
        let mut result = CleanupResult {
            floor,
            ..CleanupResult::default()
        };

        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.statuses.retain(|_, status| {
                let (state, commit_ts) = status.outcome();
                match state {
                    TxnState::Committed if commit_ts < floor => {
                        result.committed_removed += 1;
                        false
                    }
                    TxnState::Aborted | TxnState::TimedOut if status.mvv_count() == 0 => {
                        result.aborted_removed += 1;
                        false
                    }
                    _ => true,
                }
            });
        }

        if result.committed_removed + result.aborted_removed > 0 {
            debug!(
                floor,
                committed = result.committed_removed,
                aborted = result.aborted_removed,
                "aged out transaction statuses"
            );
        }
        result
    }

    // =========================================================================
    // MVV Accounting
    // =========================================================================

    /// A version written by the owner of `vh` was removed from a page
    pub fn decrement_mvv_count(&self, vh: u64) {
        if vh == PRIMORDIAL {
            return;
        }
        if let Some(status) = self.get(vh_to_ts(vh)) {
            status.decrement_mvv_count();
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn counts(&self) -> IndexCounts {
        let mut counts = IndexCounts::default();
        for shard in &self.shards {
            for status in shard.lock().statuses.values() {
                match status.state() {
                    TxnState::Active | TxnState::Committing => counts.active += 1,
                    TxnState::Committed => counts.committed += 1,
                    TxnState::Aborted | TxnState::TimedOut => counts.aborted += 1,
                }
            }
        }
        counts
    }

    pub fn wait_edge_count(&self) -> usize {
        self.wait_graph.edge_count()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn shard(&self, ts: u64) -> &Mutex<Shard> {
        &self.shards[(ts % self.shards.len() as u64) as usize]
    }
}
