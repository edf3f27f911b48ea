//! Transactions
//!
//! A `Transaction` reads a snapshot as of its start timestamp and writes new
//! versions tagged with its version handle. Writes are journaled as they
//! happen; the Begin record goes out with the first one.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::accumulator::{Accumulator, AccumulatorType};
use crate::engine::{EngineCore, WriteIntent};
use crate::error::{KeelError, Result};
use crate::journal::JournalRecord;
use crate::store::{PageId, Tree, TreeId};
use crate::txn::{Completion, TransactionStatus, TxnState};

/// Upper bound on pages remembered for pruning after a rollback
const MAX_TOUCHED_PAGES: usize = 1024;

/// A snapshot-isolated transaction
///
/// Must end with `commit` or `rollback`; dropping an unfinished transaction
/// rolls it back. After an operation fails with `Rollback`, `Timeout` or
/// `Durability` the only thing left to do is roll back.
pub struct Transaction {
    core: Arc<EngineCore>,
    status: Arc<TransactionStatus>,
    /// Begin record written
    journaled: bool,
    accumulators: Vec<Arc<Accumulator>>,
    removed_trees: Vec<TreeId>,
    touched: HashSet<PageId>,
    /// Set when an operation failed in a way that dooms the transaction
    failure: Option<KeelError>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        let status = core.index.begin();
        debug!(ts = status.ts(), "transaction started");
        Self {
            core,
            status,
            journaled: false,
            accumulators: Vec::new(),
            removed_trees: Vec::new(),
            touched: HashSet::new(),
            failure: None,
            finished: false,
        }
    }

    /// Start timestamp; also the transaction's id in the journal
    pub fn ts(&self) -> u64 {
        self.status.ts()
    }

    pub fn step(&self) -> u8 {
        self.status.step()
    }

    /// Advance the step. Later reads see writes of earlier steps; reads at
    /// an earlier step do not see later writes.
    pub fn increment_step(&mut self) -> Result<u8> {
        self.ensure_usable()?;
        self.status.increment_step()
    }

    pub fn state(&self) -> TxnState {
        self.status.state()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn fetch(&self, tree: TreeId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_usable()?;
        let tree = self.core.tree(tree)?;
        self.core.fetch(&tree, key, self.ts(), self.step())
    }

    /// Every visible key value of `tree`, ordered by key
    pub fn scan(&self, tree: TreeId) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_usable()?;
        let tree = self.core.tree(tree)?;
        self.core.scan(&tree, &[], None, self.ts(), self.step())
    }

    /// Visible key values in `[from, to)`, ordered by key
    pub fn scan_range(
        &self,
        tree: TreeId,
        from: &[u8],
        to: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_usable()?;
        let tree = self.core.tree(tree)?;
        self.core.scan(&tree, from, Some(to), self.ts(), self.step())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` under `key`, waiting up to the configured lock timeout
    /// for a concurrent writer of the same key
    pub fn store(&mut self, tree: TreeId, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let tree = self.core.tree(tree)?;
        self.begin_journal()?;

        let step = self.step();
        let deadline = Some(Instant::now() + self.core.config.lock_timeout());
        let result = self.core.write_version(
            &self.status,
            &tree,
            key,
            WriteIntent::Value(value),
            step,
            deadline,
        );
        self.check(result)?;
        self.touch(&tree, key);
        self.journal(JournalRecord::Store {
            tree_id: tree.id(),
            step,
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Remove `key`; returns whether it held a visible value
    pub fn remove(&mut self, tree: TreeId, key: &[u8]) -> Result<bool> {
        let mut to = key.to_vec();
        to.push(0);
        self.remove_range(tree, key, &to)
    }

    /// Remove every key in `[from, to)`; returns whether any held a visible
    /// value.
    ///
    /// The journal gets the exact keys removed, split over as many records
    /// as the journal block size needs.
    pub fn remove_range(&mut self, tree: TreeId, from: &[u8], to: &[u8]) -> Result<bool> {
        self.ensure_usable()?;
        let tree = self.core.tree(tree)?;
        self.begin_journal()?;

        let step = self.step();
        let deadline = Instant::now() + self.core.config.lock_timeout();
        let result = self
            .core
            .remove_range(&self.status, &tree, from, to, step, deadline);
        let removed = self.check(result)?;
        if removed.is_empty() {
            return Ok(false);
        }
        for key in &removed {
            self.touch(&tree, key);
        }

        let limit = self.remove_chunk_bytes();
        let mut chunk = Vec::new();
        let mut chunk_bytes = 0;
        for key in removed {
            if !chunk.is_empty() && chunk_bytes + key.len() + 4 > limit {
                self.journal_removal(tree.id(), step, from, to, mem::take(&mut chunk))?;
                chunk_bytes = 0;
            }
            chunk_bytes += key.len() + 4;
            chunk.push(key);
        }
        self.journal_removal(tree.id(), step, from, to, chunk)?;
        Ok(true)
    }

    /// Take an exclusive lock on `key`, waiting at most `timeout`.
    ///
    /// Locks live in a private tree that is never journaled. A second
    /// transaction locking the same key blocks until this one finishes, then
    /// fails with a write-write conflict if this one committed.
    pub fn lock(&mut self, key: &[u8], timeout: Duration) -> Result<()> {
        self.ensure_usable()?;
        let tree = Arc::clone(self.core.lock_tree());
        let deadline = Some(Instant::now() + timeout);
        let result = self.core.write_version(
            &self.status,
            &tree,
            key,
            WriteIntent::AntiValue,
            self.step(),
            deadline,
        );
        self.check(result)?;
        self.touch(&tree, key);
        Ok(())
    }

    /// Remove `tree` and its accumulators when this transaction commits
    pub fn remove_tree(&mut self, tree: TreeId) -> Result<()> {
        self.ensure_usable()?;
        let tree = self.core.tree(tree)?;
        if self.removed_trees.contains(&tree.id()) {
            return Ok(());
        }
        self.begin_journal()?;
        self.journal(JournalRecord::RemoveTree { tree_id: tree.id() })?;
        self.removed_trees.push(tree.id());
        Ok(())
    }

    // =========================================================================
    // Accumulators
    // =========================================================================

    /// Accumulator `index` of `tree`, created on first use
    pub fn accumulator(
        &mut self,
        tree: TreeId,
        index: u32,
        kind: AccumulatorType,
    ) -> Result<TxnAccumulator<'_>> {
        self.ensure_usable()?;
        let tree = self.core.tree(tree)?;
        let acc = tree.accumulator(index, kind, kind.initial_value())?;
        if !self.accumulators.iter().any(|a| Arc::ptr_eq(a, &acc)) {
            self.accumulators.push(Arc::clone(&acc));
        }
        Ok(TxnAccumulator { txn: self, acc })
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Commit. Under `CommitPolicy::Hard` returns once the Commit record is
    /// on disk.
    pub fn commit(mut self) -> Result<()> {
        if self.finished {
            return Err(KeelError::InvalidState(format!(
                "transaction {} already finished",
                self.ts()
            )));
        }
        if let Some(failure) = self.failure.take() {
            self.abort(completion_for(&failure));
            return Err(KeelError::Rollback(format!(
                "transaction {} must roll back after: {}",
                self.ts(),
                failure
            )));
        }
        if let Err(e) = self.journal_accumulators() {
            self.abort(Completion::Aborted);
            return Err(e);
        }

        let ts = self.ts();
        let tree_guard = (!self.removed_trees.is_empty()).then(|| self.core.tree_lock.lock());
        let commit_ts = match self.core.index.start_commit(&self.status) {
            Ok(commit_ts) => commit_ts,
            Err(e) => {
                drop(tree_guard);
                self.abort(Completion::Aborted);
                return Err(e);
            }
        };
        for acc in &self.accumulators {
            acc.stamp_commit(ts, commit_ts);
        }

        if self.journaled {
            if let Err(e) = self.core.journal.commit(ts, commit_ts) {
                drop(tree_guard);
                warn!(ts, commit_ts, error = %e, "commit record not durable");
                self.abort(Completion::Aborted);
                return Err(e);
            }
        }
        for tree_id in &self.removed_trees {
            if self.core.store.remove_tree(*tree_id).is_some() {
                debug!(tree_id, "tree removed");
            }
        }
        drop(tree_guard);

        let at = self.core.allocator().update_timestamp();
        self.finished = true;
        self.core
            .index
            .notify_completed(&self.status, Completion::Committed, at)?;
        self.core.record_commit();
        debug!(ts, commit_ts, "transaction committed");
        Ok(())
    }

    /// Roll back; versions written become invisible and are pruned
    pub fn rollback(mut self) -> Result<()> {
        if self.finished {
            return Err(KeelError::InvalidState(format!(
                "transaction {} already finished",
                self.ts()
            )));
        }
        let completion = self
            .failure
            .as_ref()
            .map_or(Completion::Aborted, completion_for);
        self.abort(completion);
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_usable(&self) -> Result<()> {
        if self.finished {
            return Err(KeelError::InvalidState(format!(
                "transaction {} already finished",
                self.ts()
            )));
        }
        if let Some(failure) = &self.failure {
            return Err(KeelError::Rollback(format!(
                "transaction {} must roll back after: {}",
                self.ts(),
                failure
            )));
        }
        Ok(())
    }

    /// Remember errors that doom the transaction
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            if e.is_retryable() || matches!(e, KeelError::Durability(_)) {
                self.failure = Some(clone_failure(&e));
            }
            e
        })
    }

    fn begin_journal(&mut self) -> Result<()> {
        if self.journaled {
            return Ok(());
        }
        let ts = self.ts();
        let result = self
            .core
            .journal
            .append(ts, JournalRecord::BeginTransaction { start_ts: ts });
        self.check(result)?;
        self.journaled = true;
        Ok(())
    }

    fn journal(&mut self, record: JournalRecord) -> Result<()> {
        let result = self.core.journal.append(self.ts(), record);
        self.check(result).map(|_| ())
    }

    fn journal_removal(
        &mut self,
        tree_id: TreeId,
        step: u8,
        from: &[u8],
        to: &[u8],
        keys: Vec<Vec<u8>>,
    ) -> Result<()> {
        self.journal(JournalRecord::RemoveRange {
            tree_id,
            step,
            from: from.to_vec(),
            to: to.to_vec(),
            keys,
        })
    }

    /// Key bytes per RemoveRange record, leaving room for the bounds and
    /// the record framing
    fn remove_chunk_bytes(&self) -> usize {
        (self.core.config.journal_block_size / 4) as usize
    }

    /// One AccumulatorDelta record per accumulator this transaction changed
    fn journal_accumulators(&mut self) -> Result<()> {
        let ts = self.ts();
        let deltas: Vec<_> = self
            .accumulators
            .iter()
            .filter_map(|acc| acc.pending_delta(ts).map(|value| (Arc::clone(acc), value)))
            .collect();
        if deltas.is_empty() {
            return Ok(());
        }
        self.begin_journal()?;
        for (acc, value) in deltas {
            self.journal(JournalRecord::AccumulatorDelta {
                tree_id: acc.tree_id(),
                index: acc.index(),
                kind: acc.kind(),
                value,
            })?;
        }
        Ok(())
    }

    fn touch(&mut self, tree: &Tree, key: &[u8]) {
        self.remember(PageId {
            tree_id: tree.id(),
            page_no: tree.page_for(key),
        });
    }

    fn remember(&mut self, page: PageId) {
        if self.touched.len() < MAX_TOUCHED_PAGES {
            self.touched.insert(page);
        }
    }

    fn abort(&mut self, completion: Completion) {
        self.finished = true;
        let ts = self.ts();
        if self.journaled {
            if let Err(e) = self.core.journal.rollback(ts) {
                // Without a Commit record recovery discards it anyway
                warn!(ts, error = %e, "rollback record not written");
            }
        }
        for acc in &self.accumulators {
            acc.discard(ts);
        }
        let at = self.core.allocator().update_timestamp();
        if let Err(e) = self.core.index.notify_completed(&self.status, completion, at) {
            warn!(ts, error = %e, "could not complete rolled back transaction");
        }
        self.core.prune_touched(&self.touched);
        self.core.record_rollback();
        debug!(ts, ?completion, "transaction rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.abort(Completion::Aborted);
        }
    }
}

/// A transaction's view of one accumulator
pub struct TxnAccumulator<'a> {
    txn: &'a mut Transaction,
    acc: Arc<Accumulator>,
}

impl TxnAccumulator<'_> {
    /// Contribute `amount`; visible to others once the transaction commits
    pub fn add(&mut self, amount: i64) -> Result<()> {
        self.txn.ensure_usable()?;
        self.acc.delta(self.txn.ts(), amount);
        Ok(())
    }

    /// Value as of the transaction's start, including its own contribution
    pub fn snapshot_value(&self) -> Result<i64> {
        self.txn.ensure_usable()?;
        Ok(self
            .acc
            .snapshot_value(&self.txn.core.index, self.txn.ts(), Some(self.txn.ts())))
    }

    /// Next value of a sequence accumulator; unique even across rollbacks
    pub fn allocate(&mut self) -> Result<i64> {
        self.txn.ensure_usable()?;
        self.acc.allocate(self.txn.ts())
    }

    /// Running value including other transactions' uncommitted work
    pub fn live_value(&self) -> i64 {
        self.acc.live_value()
    }
}

fn completion_for(failure: &KeelError) -> Completion {
    match failure {
        KeelError::Timeout(_) => Completion::TimedOut,
        _ => Completion::Aborted,
    }
}

/// Keep the kind and message of a failure that dooms the transaction
fn clone_failure(e: &KeelError) -> KeelError {
    match e {
        KeelError::Rollback(msg) => KeelError::Rollback(msg.clone()),
        KeelError::Timeout(msg) => KeelError::Timeout(msg.clone()),
        other => KeelError::Durability(other.to_string()),
    }
}
