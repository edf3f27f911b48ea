//! Transactional accumulator state

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::error::{KeelError, Result};
use crate::mvv::handle::ts_to_vh;
use crate::txn::{CommitStatus, TransactionIndex};

use super::AccumulatorType;

#[derive(Debug, Clone, Copy)]
struct PendingDelta {
    amount: i64,
    /// Stamped when the owner obtains its commit timestamp
    commit_ts: Option<u64>,
}

#[derive(Debug)]
struct AccumulatorState {
    base: i64,
    deltas: HashMap<u64, PendingDelta>,
}

/// A per-tree aggregate whose contributions follow transaction visibility.
///
/// Each transaction's contribution is a single pending delta keyed by its
/// start timestamp. Readers fold the committed deltas they can see onto the
/// base value. Cleanup folds a delta into the base once no reader can see
/// the accumulator without it.
#[derive(Debug)]
pub struct Accumulator {
    tree_id: u32,
    index: u32,
    kind: AccumulatorType,
    state: Mutex<AccumulatorState>,
    /// Non-transactional running value; includes uncommitted contributions
    live_value: AtomicI64,
}

impl Accumulator {
    pub fn new(tree_id: u32, index: u32, kind: AccumulatorType, base: i64) -> Self {
        Self {
            tree_id,
            index,
            kind,
            state: Mutex::new(AccumulatorState {
                base,
                deltas: HashMap::new(),
            }),
            live_value: AtomicI64::new(base),
        }
    }

    pub fn tree_id(&self) -> u32 {
        self.tree_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn kind(&self) -> AccumulatorType {
        self.kind
    }

    // =========================================================================
    // Contributions
    // =========================================================================

    /// Combine `amount` into the pending delta of transaction `txn_ts`
    pub fn delta(&self, txn_ts: u64, amount: i64) {
        {
            let mut state = self.state.lock();
            let kind = self.kind;
            state
                .deltas
                .entry(txn_ts)
                .and_modify(|d| d.amount = kind.combine(d.amount, amount))
                .or_insert(PendingDelta {
                    amount,
                    commit_ts: None,
                });
        }
        self.update_live_value(amount);
    }

    /// Issue the next sequence value for a SEQ accumulator. Values are unique
    /// across transactions even if the allocating transaction rolls back.
    pub fn allocate(&self, txn_ts: u64) -> Result<i64> {
        if self.kind != AccumulatorType::Seq {
            return Err(KeelError::InvalidState(format!(
                "allocate on {:?} accumulator {}/{}",
                self.kind, self.tree_id, self.index
            )));
        }
        let value = self.live_value.fetch_add(1, Ordering::AcqRel) + 1;
        self.state
            .lock()
            .deltas
            .entry(txn_ts)
            .and_modify(|d| d.amount = d.amount.max(value))
            .or_insert(PendingDelta {
                amount: value,
                commit_ts: None,
            });
        Ok(value)
    }

    /// Record the commit timestamp of `txn_ts`'s delta, if it has one
    pub fn stamp_commit(&self, txn_ts: u64, commit_ts: u64) {
        if let Some(delta) = self.state.lock().deltas.get_mut(&txn_ts) {
            delta.commit_ts = Some(commit_ts);
        }
    }

    /// Drop the delta of a rolled back transaction
    pub fn discard(&self, txn_ts: u64) -> bool {
        self.state.lock().deltas.remove(&txn_ts).is_some()
    }

    pub fn has_delta(&self, txn_ts: u64) -> bool {
        self.state.lock().deltas.contains_key(&txn_ts)
    }

    /// Combined amount contributed so far by `txn_ts`
    pub fn pending_delta(&self, txn_ts: u64) -> Option<i64> {
        self.state.lock().deltas.get(&txn_ts).map(|d| d.amount)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value seen by a reader at `as_of`: the base folded with every delta
    /// committed at or before `as_of` in commit order, then the reader's own
    /// pending delta when `own_ts` is given.
    pub fn snapshot_value(&self, index: &TransactionIndex, as_of: u64, own_ts: Option<u64>) -> i64 {
        // Copy out first: resolving an in-flight commit may block
        let (base, deltas): (i64, Vec<(u64, PendingDelta)>) = {
            let state = self.state.lock();
            (state.base, state.deltas.iter().map(|(&ts, &d)| (ts, d)).collect())
        };
        let mut committed = Vec::new();
        let mut own = None;

        for (ts, delta) in &deltas {
            let ts = *ts;
            if Some(ts) == own_ts {
                own = Some(delta.amount);
                continue;
            }
            if let Some(commit_ts) = self.committed_at(index, ts, delta, as_of) {
                committed.push((commit_ts, delta.amount));
            }
        }
        committed.sort_unstable_by_key(|&(commit_ts, _)| commit_ts);

        let folded = committed
            .into_iter()
            .fold(base, |acc, (_, amount)| self.kind.combine(acc, amount));
        match own {
            Some(amount) => self.kind.combine(folded, amount),
            None => folded,
        }
    }

    /// Running value including uncommitted contributions
    pub fn live_value(&self) -> i64 {
        self.live_value.load(Ordering::Acquire)
    }

    pub fn base_value(&self) -> i64 {
        self.state.lock().base
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().deltas.len()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Fold deltas committed before `floor` into the base and drop deltas of
    /// aborted transactions. Returns the number of deltas removed.
    pub fn fold(&self, index: &TransactionIndex, floor: u64) -> usize {
        let mut state = self.state.lock();
        let mut foldable = Vec::new();
        let mut aborted = Vec::new();

        for (&ts, delta) in &state.deltas {
            match index.peek_status(ts_to_vh(ts, 0)) {
                CommitStatus::Aborted => aborted.push(ts),
                CommitStatus::Committed(commit_ts) => {
                    let commit_ts = delta.commit_ts.unwrap_or(commit_ts);
                    if commit_ts < floor {
                        foldable.push((commit_ts, ts));
                    }
                }
                CommitStatus::Uncommitted => {}
            }
        }
        foldable.sort_unstable();

        for ts in &aborted {
            state.deltas.remove(ts);
        }
        let mut base = state.base;
        for (_, ts) in &foldable {
            if let Some(delta) = state.deltas.remove(ts) {
                base = self.kind.combine(base, delta.amount);
            }
        }
        state.base = base;
        foldable.len() + aborted.len()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn committed_at(
        &self,
        index: &TransactionIndex,
        ts: u64,
        delta: &PendingDelta,
        as_of: u64,
    ) -> Option<u64> {
        match index.commit_status(ts_to_vh(ts, 0), as_of, 0) {
            CommitStatus::Committed(commit_ts) => {
                // An aged-out status reports its start timestamp
                let commit_ts = delta.commit_ts.unwrap_or(commit_ts);
                (commit_ts <= as_of).then_some(commit_ts)
            }
            CommitStatus::Uncommitted | CommitStatus::Aborted => None,
        }
    }

    fn update_live_value(&self, amount: i64) {
        let kind = self.kind;
        let _ = self
            .live_value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(match kind {
                    AccumulatorType::Seq => current.max(amount),
                    other => other.combine(current, amount),
                })
            });
    }
}
