//! MVV Pruning
//!
//! Removes versions no reader can still see. Runs under the owning page's
//! exclusive latch.

use crate::error::Result;
use crate::txn::{CommitStatus, TransactionIndex};

use super::codec::{decode, encode, Payload, Version};
use super::handle::PRIMORDIAL;

/// Result of pruning one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneOutcome {
    pub record: Vec<u8>,
    /// Versions dropped from the record
    pub removed: usize,
    /// False when the record was already fully pruned
    pub changed: bool,
}

impl PruneOutcome {
    /// A lone primordial AntiValue: the key can be physically removed
    pub fn is_removed_key(&self) -> Result<bool> {
        let versions = decode(&self.record)?;
        Ok(matches!(
            versions.as_slice(),
            [Version {
                vh: PRIMORDIAL,
                payload: Payload::AntiValue
            }]
        ))
    }
}

/// Prune `record` against the index's current active transaction cache.
///
/// Drops versions of aborted transactions and committed versions superseded
/// by a newer committed version when no active transaction started between
/// the two commits. The last version left always survives: a record never
/// prunes to nothing, it degrades to a primordial version instead. A lone
/// committed version older than every active transaction becomes
/// primordial.
pub fn prune(record: &[u8], index: &TransactionIndex) -> Result<PruneOutcome> {
    let versions = decode(record)?;
    let original = versions.len();
    if original == 0 {
        return Ok(PruneOutcome {
            record: Vec::new(),
            removed: 0,
            changed: false,
        });
    }

    let mut kept: Vec<(Version<'_>, CommitStatus)> = Vec::with_capacity(original);
    let mut last_committed: Option<(usize, u64)> = None;
    let mut superseded = Vec::new();
    let mut removed = 0;

    for version in versions {
        let status = index.peek_status(version.vh);
        match status {
            CommitStatus::Aborted => {
                removed += 1;
                index.decrement_mvv_count(version.vh);
            }
            CommitStatus::Uncommitted => kept.push((version, status)),
            CommitStatus::Committed(commit_ts) => {
                if let Some((pos, previous_ts)) = last_committed {
                    if !index.has_concurrent_transaction(previous_ts, commit_ts) {
                        superseded.push(pos);
                    }
                }
                last_committed = Some((kept.len(), commit_ts));
                kept.push((version, status));
            }
        }
    }

    for &pos in superseded.iter().rev() {
        removed += 1;
        let (version, _) = kept.remove(pos);
        index.decrement_mvv_count(version.vh);
    }

    let collapsed = match kept.as_slice() {
        [] => Some(Version {
            vh: PRIMORDIAL,
            payload: Payload::AntiValue,
        }),
        [(version, CommitStatus::Committed(commit_ts))]
            if version.vh != PRIMORDIAL && !index.has_concurrent_transaction(0, *commit_ts) =>
        {
            index.decrement_mvv_count(version.vh);
            Some(Version {
                vh: PRIMORDIAL,
                payload: version.payload,
            })
        }
        _ => None,
    };
    let survivors: Vec<Version<'_>> = match collapsed {
        Some(version) => vec![version],
        None => kept.into_iter().map(|(version, _)| version).collect(),
    };

    let pruned = encode(&survivors);
    let changed = pruned != record;
    Ok(PruneOutcome {
        removed,
        record: pruned,
        changed,
    })
}
