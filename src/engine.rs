//! Engine Module
//!
//! Coordinates the transaction index, page store, journal and checkpoints.
//!
//! ## Responsibilities
//! - Recover from the last checkpoint image and the journal on startup
//! - Write paths shared by live transactions and replay
//! - Consistent checkpoints and deletion of journal files they supersede
//! - Own the cleanup and journal flusher threads

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::accumulator::Accumulator;
use crate::cleanup::{CleanupManager, CleanupPassStats, CleanupStatsSnapshot};
use crate::config::{CommitPolicy, Config};
use crate::error::{KeelError, Result};
use crate::journal::{CheckpointInfo, JournalFlusher, JournalManager, JournalRecord, NO_TRANSACTION};
use crate::mvv::handle::{ts_to_vh, vh_to_ts, PRIMORDIAL};
use crate::mvv::{
    encode, fetch_visible, is_primordial, prune, store_version, versions, Payload, Version,
};
use crate::recovery::{
    RecoveredTransaction, RecoveredTree, RecoveryManager, RecoveryPlan, RecoveryStats, ReplayOp,
};
use crate::snapshot::{
    self, AccumulatorManifest, SnapshotBuilder, SnapshotManifest, SnapshotReader, TreeManifest,
};
use crate::store::{PageId, PageStore, Tree, TreeId};
use crate::transaction::Transaction;
use crate::txn::{Completion, TimestampAllocator, TransactionIndex, TransactionStatus, WwDependency};

/// Id of the lock tree; user trees start at 1
const LOCK_TREE_ID: TreeId = 0;

/// What a write puts in the key's record
#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteIntent<'a> {
    Value(&'a [u8]),
    /// AntiValue, written only over a visible value
    Remove,
    /// AntiValue, always written; used by the lock tree and by replay of
    /// removals
    AntiValue,
}

impl<'a> WriteIntent<'a> {
    fn payload(self) -> Payload<'a> {
        match self {
            WriteIntent::Value(value) => Payload::Value(value),
            WriteIntent::Remove | WriteIntent::AntiValue => Payload::AntiValue,
        }
    }
}

/// Counters for transaction outcomes and waits
#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    write_conflicts: AtomicU64,
    deadlocks: AtomicU64,
    lock_timeouts: AtomicU64,
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub commits: u64,
    pub rollbacks: u64,
    pub write_conflicts: u64,
    pub deadlocks: u64,
    pub lock_timeouts: u64,
}

/// Result of pruning one page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PagePrune {
    pub versions_removed: u64,
    pub keys_removed: u64,
}

/// State shared by the engine handle, transactions and background threads
pub(crate) struct EngineCore {
    pub(crate) config: Config,
    checkpoint_dir: PathBuf,
    pub(crate) index: TransactionIndex,
    pub(crate) journal: Arc<JournalManager>,
    pub(crate) store: PageStore,
    lock_tree: Arc<Tree>,
    /// Orders tree creation and removal against checkpoint timestamps
    pub(crate) tree_lock: Mutex<()>,
    checkpoint_lock: Mutex<()>,
    stats: EngineStats,
}

/// The main engine handle
///
/// ## Concurrency Model
///
/// - **Transactions** run concurrently on any thread; each holds an `Arc`
///   of the shared core
/// - **Page latches** are exclusive and held only for one record operation;
///   a writer blocked on another transaction drops its latch before waiting
/// - **Commit ordering** is decided by the transaction index under its
///   commit lock; checkpoints take their timestamp the same way
/// - **Background**: the cleanup manager prunes and folds, the flusher
///   fsyncs the journal under `CommitPolicy::Soft`
pub struct Engine {
    core: Arc<EngineCore>,
    cleanup: Option<CleanupManager>,
    flusher: Option<JournalFlusher>,
    recovery: RecoveryStats,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const JOURNAL_DIR: &'static str = "journal";
    const CHECKPOINT_DIR: &'static str = "checkpoints";

    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate config and create directories
    /// 2. Scan the journal and plan recovery
    /// 3. Load the checkpoint image
    /// 4. Open the journal in a fresh file
    /// 5. Replay transactions committed after the checkpoint
    /// 6. Prune and checkpoint the recovered state
    /// 7. Start background threads
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Validate config and create directories
        config.validate()?;
        let journal_dir = config.data_dir.join(Self::JOURNAL_DIR);
        let checkpoint_dir = config.data_dir.join(Self::CHECKPOINT_DIR);
        fs::create_dir_all(&journal_dir)?;
        fs::create_dir_all(&checkpoint_dir)?;

        // Step 2: Scan the journal, drop a torn tail, and plan recovery
        let mut recovery = RecoveryManager::new(&journal_dir, &checkpoint_dir);
        let plan = recovery.recover()?;

        // Step 3: Rebuild trees and accumulators from the checkpoint image
        let allocator = Arc::new(TimestampAllocator::starting_at(plan.max_timestamp));
        let index = TransactionIndex::new(allocator, config.status_shards);
        let store = PageStore::new(config.pages_per_tree);
        if let Some(path) = &plan.image {
            load_image(&store, path)?;
        }
        store.reserve_tree_id(plan.max_tree_id);

        // Step 4: Open the journal; new records go to a fresh generation
        let journal = Arc::new(JournalManager::open(&journal_dir, &config)?);

        let lock_tree = Arc::new(Tree::new(LOCK_TREE_ID, "_locks", 0, config.pages_per_tree));
        let core = Arc::new(EngineCore {
            checkpoint_dir,
            index,
            journal,
            store,
            lock_tree,
            tree_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            stats: EngineStats::default(),
            config,
        });

        // Step 5: Replay committed transactions in commit order
        let stats = core.replay(&plan)?;
        recovery.finish(&stats)?;

        // Step 6: Collapse recovered versions, then checkpoint so the old
        // journal files can go
        core.cleanup_pass()?;
        core.checkpoint()?;

        // Step 7: Start background threads
        let cleanup = CleanupManager::spawn(Arc::clone(&core))?;
        let flusher = match core.config.commit_policy {
            CommitPolicy::Soft => Some(JournalFlusher::spawn(
                Arc::clone(&core.journal),
                core.config.flush_interval(),
            )?),
            CommitPolicy::Hard => None,
        };

        info!(
            data_dir = %core.config.data_dir.display(),
            trees = core.store.tree_count(),
            replayed = stats.committed_transactions,
            "engine opened"
        );
        Ok(Self {
            core,
            cleanup: Some(cleanup),
            flusher,
            recovery: stats,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config {
            data_dir: path.to_path_buf(),
            ..Config::default()
        };
        Self::open(config)
    }

    /// Start a transaction
    pub fn begin(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.core))
    }

    // =========================================================================
    // Trees
    // =========================================================================

    /// Create a tree; fails if the name is taken
    pub fn create_tree(&self, name: &str) -> Result<TreeId> {
        Ok(self.core.create_tree(name)?.id())
    }

    /// Id of the tree named `name`, creating it if absent
    pub fn open_tree(&self, name: &str) -> Result<TreeId> {
        match self.core.store.tree_by_name(name) {
            Some(tree) => Ok(tree.id()),
            None => match self.core.create_tree(name) {
                Ok(tree) => Ok(tree.id()),
                Err(KeelError::TreeExists(_)) => self
                    .tree_id(name)
                    .ok_or_else(|| KeelError::TreeNotFound(name.to_string())),
                Err(e) => Err(e),
            },
        }
    }

    pub fn tree_id(&self, name: &str) -> Option<TreeId> {
        self.core.store.tree_by_name(name).map(|t| t.id())
    }

    /// Names of all trees, ordered by id
    pub fn tree_names(&self) -> Vec<String> {
        self.core
            .store
            .trees()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    // =========================================================================
    // Auto-commit Operations
    // =========================================================================

    /// Store in a transaction of its own
    pub fn store(&self, tree: TreeId, key: &[u8], value: &[u8]) -> Result<()> {
        let mut txn = self.begin();
        txn.store(tree, key, value)?;
        txn.commit()
    }

    /// Read the latest committed value
    pub fn fetch(&self, tree: TreeId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.begin();
        let value = txn.fetch(tree, key)?;
        txn.commit()?;
        Ok(value)
    }

    /// Remove in a transaction of its own
    pub fn remove(&self, tree: TreeId, key: &[u8]) -> Result<bool> {
        let mut txn = self.begin();
        let removed = txn.remove(tree, key)?;
        txn.commit()?;
        Ok(removed)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Write a checkpoint image and record, then delete journal files and
    /// images it supersedes
    pub fn checkpoint(&self) -> Result<CheckpointInfo> {
        self.core.checkpoint()
    }

    /// Run one cleanup pass on the calling thread
    pub fn cleanup(&self) -> Result<CleanupPassStats> {
        self.core.cleanup_pass()
    }

    /// Checkpoint, then stop background threads
    pub fn close(mut self) -> Result<()> {
        let result = self.core.checkpoint().map(|_| ());
        self.stop_threads();
        result
    }

    /// Stop without a checkpoint, leaving recovery to the next open.
    /// For crash testing.
    pub fn crash(mut self) {
        warn!("engine stopped without a checkpoint");
        if let Some(mut cleanup) = self.cleanup.take() {
            cleanup.stop();
        }
        // Unforced journal bytes are lost, as in a real crash
        if let Some(mut flusher) = self.flusher.take() {
            flusher.abort();
        }
    }

    fn stop_threads(&mut self) {
        if let Some(mut cleanup) = self.cleanup.take() {
            cleanup.stop();
        }
        if let Some(mut flusher) = self.flusher.take() {
            flusher.stop();
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn index(&self) -> &TransactionIndex {
        &self.core.index
    }

    pub fn journal(&self) -> &JournalManager {
        &self.core.journal
    }

    /// What recovery did when this engine opened
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    pub fn cleanup_stats(&self) -> CleanupStatsSnapshot {
        self.cleanup
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        let s = &self.core.stats;
        EngineStatsSnapshot {
            commits: s.commits.load(Ordering::Relaxed),
            rollbacks: s.rollbacks.load(Ordering::Relaxed),
            write_conflicts: s.write_conflicts.load(Ordering::Relaxed),
            deadlocks: s.deadlocks.load(Ordering::Relaxed),
            lock_timeouts: s.lock_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Number of versions stored under `key`, including invisible ones
    pub fn version_count(&self, tree: TreeId, key: &[u8]) -> Result<usize> {
        let tree = self.core.tree(tree)?;
        let page = tree.acquire(tree.page_for(key));
        match page.read_mvv_record(key) {
            Some(record) => crate::mvv::version_count(record),
            None => Ok(0),
        }
    }

    /// Number of keys physically held by the lock tree
    pub fn lock_tree_size(&self) -> usize {
        self.core
            .lock_tree
            .pages()
            .map(|p| p.acquire().record_count())
            .sum()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

// =============================================================================
// Core: Write Paths
// =============================================================================

impl EngineCore {
    pub(crate) fn tree(&self, id: TreeId) -> Result<Arc<Tree>> {
        self.store
            .tree(id)
            .ok_or_else(|| KeelError::TreeNotFound(format!("id {}", id)))
    }

    pub(crate) fn lock_tree(&self) -> &Arc<Tree> {
        &self.lock_tree
    }

    pub(crate) fn allocator(&self) -> &TimestampAllocator {
        self.index.allocator()
    }

    /// Add a version for `status` at `step` under `key`.
    ///
    /// With a `deadline`, every other transaction's version is checked for a
    /// write-write dependency first; the page latch is dropped while waiting
    /// and the record is re-read afterwards. Replay passes `None`.
    ///
    /// Returns whether the key held a value visible to the writer.
    pub(crate) fn write_version(
        &self,
        status: &TransactionStatus,
        tree: &Tree,
        key: &[u8],
        intent: WriteIntent<'_>,
        step: u8,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        let me = status.ts();
        let vh = ts_to_vh(me, step);
        let page_no = tree.page_for(key);

        loop {
            let mut page = tree.acquire(page_no);
            let current = page
                .read_mvv_record(key)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();

            if let Some(deadline) = deadline {
                if let Some(blocker) = self.first_blocker(&current, status)? {
                    drop(page);
                    self.wait_for_writer(blocker, status, deadline)?;
                    continue;
                }
            }

            let existed = matches!(
                fetch_visible(&current, &self.index, me, step)?,
                Some(Payload::Value(_))
            );
            if matches!(intent, WriteIntent::Remove) && !existed {
                return Ok(false);
            }

            // A new key starts from a primordial AntiValue so older readers
            // see it as absent
            let seeded = if current.is_empty() {
                encode(&[Version {
                    vh: PRIMORDIAL,
                    payload: Payload::AntiValue,
                }])
            } else {
                current
            };

            let limit = self.config.max_record_size;
            let outcome = match store_version(&seeded, vh, intent.payload(), limit) {
                Err(KeelError::RecordTooLong { .. }) => {
                    let pruned = prune(&seeded, &self.index)?;
                    store_version(&pruned.record, vh, intent.payload(), limit)?
                }
                other => other?,
            };

            page.write_mvv_record(key, outcome.record);
            page.mark_dirty(me);
            page.set_needs_prune(true);
            if outcome.inserted {
                status.increment_mvv_count();
            }
            return Ok(existed);
        }
    }

    /// Write AntiValues over every visible key in `[from, to)`. Returns
    /// the keys written, in order.
    pub(crate) fn remove_range(
        &self,
        status: &TransactionStatus,
        tree: &Tree,
        from: &[u8],
        to: &[u8],
        step: u8,
        deadline: Instant,
    ) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for page in tree.pages() {
            keys.extend(page.acquire().keys_in_range(from, to));
        }
        keys.sort();

        let mut removed = Vec::new();
        for key in keys {
            let intent = WriteIntent::Remove;
            if self.write_version(status, tree, &key, intent, step, Some(deadline))? {
                removed.push(key);
            }
        }
        Ok(removed)
    }

    /// The value of `key` visible at `(ts, step)`
    pub(crate) fn fetch(
        &self,
        tree: &Tree,
        key: &[u8],
        ts: u64,
        step: u8,
    ) -> Result<Option<Vec<u8>>> {
        let page = tree.acquire(tree.page_for(key));
        let Some(record) = page.read_mvv_record(key) else {
            return Ok(None);
        };
        Ok(fetch_visible(record, &self.index, ts, step)?
            .and_then(Payload::as_value)
            .map(<[u8]>::to_vec))
    }

    /// Visible key values in `[from, to)`, ordered by key; `to = None`
    /// scans to the end
    pub(crate) fn scan(
        &self,
        tree: &Tree,
        from: &[u8],
        to: Option<&[u8]>,
        ts: u64,
        step: u8,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for page in tree.pages() {
            let page = page.acquire();
            for (key, record) in page.records() {
                if key < from || to.is_some_and(|to| key >= to) {
                    continue;
                }
                if let Some(Payload::Value(value)) = fetch_visible(record, &self.index, ts, step)? {
                    out.push((key.to_vec(), value.to_vec()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// First version written by another transaction that blocks `status`
    /// right now. Conflicts with a transaction that committed after
    /// `status` began fail immediately.
    fn first_blocker(&self, record: &[u8], status: &TransactionStatus) -> Result<Option<u64>> {
        for version in versions(record) {
            let version = version?;
            if version.vh == PRIMORDIAL || vh_to_ts(version.vh) == status.ts() {
                continue;
            }
            match self.index.ww_dependency(version.vh, status, Duration::ZERO) {
                WwDependency::None => {}
                WwDependency::TimedOut => return Ok(Some(version.vh)),
                other => return Err(self.dependency_error(other, status)),
            }
        }
        Ok(None)
    }

    fn wait_for_writer(
        &self,
        vh: u64,
        status: &TransactionStatus,
        deadline: Instant,
    ) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.index.ww_dependency(vh, status, remaining) {
            WwDependency::None => Ok(()),
            other => Err(self.dependency_error(other, status)),
        }
    }

    fn dependency_error(&self, dependency: WwDependency, status: &TransactionStatus) -> KeelError {
        match dependency {
            WwDependency::Conflict(commit_ts) => {
                self.stats.write_conflicts.fetch_add(1, Ordering::Relaxed);
                KeelError::Rollback(format!(
                    "write-write conflict: transaction {} collides with a commit at {}",
                    status.ts(),
                    commit_ts
                ))
            }
            WwDependency::Deadlock => {
                self.stats.deadlocks.fetch_add(1, Ordering::Relaxed);
                KeelError::Rollback(format!(
                    "transaction {} chosen as deadlock victim",
                    status.ts()
                ))
            }
            WwDependency::TimedOut => {
                self.stats.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                KeelError::Timeout(format!(
                    "transaction {} gave up waiting for a concurrent writer",
                    status.ts()
                ))
            }
            WwDependency::None => KeelError::InvalidState("no dependency to report".into()),
        }
    }

    // =========================================================================
    // Trees
    // =========================================================================

    pub(crate) fn create_tree(&self, name: &str) -> Result<Arc<Tree>> {
        if name.is_empty() || name.starts_with('_') {
            return Err(KeelError::InvalidState(format!("invalid tree name {:?}", name)));
        }
        let _trees = self.tree_lock.lock();
        if self.store.tree_by_name(name).is_some() {
            return Err(KeelError::TreeExists(name.to_string()));
        }
        let tree_id = self.store.allocate_tree_id();
        let timestamp = self.allocator().update_timestamp();
        self.journal.append(
            NO_TRANSACTION,
            JournalRecord::CreateTree {
                tree_id,
                timestamp,
                name: name.to_string(),
            },
        )?;
        let tree = self.store.insert_tree(tree_id, name, timestamp)?;
        debug!(tree_id, name, timestamp, "tree created");
        Ok(tree)
    }

    // =========================================================================
    // Transaction Outcomes
    // =========================================================================

    pub(crate) fn record_commit(&self) {
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Prune pages a rolled back transaction wrote to, so its versions do
    /// not wait for the next cleanup pass
    pub(crate) fn prune_touched(&self, touched: &HashSet<PageId>) {
        for page_id in touched {
            let tree = if page_id.tree_id == LOCK_TREE_ID {
                Some(Arc::clone(&self.lock_tree))
            } else {
                self.store.tree(page_id.tree_id)
            };
            if let Some(tree) = tree {
                if let Err(e) = self.prune_page(&tree, page_id.page_no) {
                    warn!(?page_id, error = %e, "pruning after rollback failed");
                }
            }
        }
    }

    // =========================================================================
    // Pruning and Cleanup
    // =========================================================================

    /// Prune every record of one page
    pub(crate) fn prune_page(&self, tree: &Tree, page_no: usize) -> Result<PagePrune> {
        let mut page = tree.acquire(page_no);
        let mut result = PagePrune::default();
        let mut needs_prune = false;

        for key in page.keys() {
            let Some(record) = page.read_mvv_record(&key) else {
                continue;
            };
            let outcome = prune(record, &self.index)?;
            result.versions_removed += outcome.removed as u64;

            if outcome.is_removed_key()? {
                page.write_mvv_record(&key, Vec::new());
                result.keys_removed += 1;
                continue;
            }
            if !is_primordial(&outcome.record)? {
                needs_prune = true;
            }
            if outcome.changed {
                page.write_mvv_record(&key, outcome.record);
            }
        }
        page.set_needs_prune(needs_prune);
        Ok(result)
    }

    /// One pass of background maintenance
    pub(crate) fn cleanup_pass(&self) -> Result<CleanupPassStats> {
        let cache = self.index.update_active_transaction_cache();
        let mut stats = CleanupPassStats::default();

        let mut trees = self.store.trees();
        trees.push(Arc::clone(&self.lock_tree));
        for tree in &trees {
            for page in tree.pages() {
                if !page.needs_prune() {
                    continue;
                }
                let pruned = self.prune_page(tree, page.id().page_no)?;
                stats.pages_pruned += 1;
                stats.versions_removed += pruned.versions_removed;
                stats.keys_removed += pruned.keys_removed;
            }
            stats.deltas_folded += tree.fold_accumulators(&self.index, cache.floor) as u64;
        }

        let aged = self.index.cleanup();
        stats.statuses_aged = (aged.committed_removed + aged.aborted_removed) as u64;
        Ok(stats)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Checkpoint at a timestamp ordered against every commit
    ///
    /// The base address is read before the timestamp is taken: a
    /// transaction that commits after the timestamp was either live when the
    /// base was read or journals entirely above it.
    pub(crate) fn checkpoint(&self) -> Result<CheckpointInfo> {
        let _serial = self.checkpoint_lock.lock();
        let base = self.journal.base_address();
        let reader = {
            let _trees = self.tree_lock.lock();
            self.index.begin_checkpoint()
        };

        let result = self.write_checkpoint(&reader, base);
        let at = self.allocator().update_timestamp();
        self.index.notify_completed(&reader, Completion::Aborted, at)?;
        result
    }

    fn write_checkpoint(&self, reader: &TransactionStatus, base: u64) -> Result<CheckpointInfo> {
        let timestamp = reader.ts();
        let mut builder = SnapshotBuilder::new(&self.checkpoint_dir, timestamp)?;
        let mut manifest = SnapshotManifest {
            timestamp,
            next_tree_id: self.store.next_tree_id(),
            trees: Vec::new(),
        };

        for tree in self.store.trees() {
            if tree.created_at() > timestamp {
                continue;
            }
            let mut entries = Vec::new();
            for page in tree.pages() {
                let page = page.acquire();
                for (key, record) in page.records() {
                    if let Some(Payload::Value(value)) =
                        fetch_visible(record, &self.index, timestamp, 0)?
                    {
                        entries.push((key.to_vec(), value.to_vec()));
                    }
                }
            }
            entries.sort();
            for (key, value) in &entries {
                builder.add(tree.id(), key, value)?;
            }

            let accumulators = tree
                .accumulators()
                .iter()
                .map(|acc| AccumulatorManifest {
                    index: acc.index(),
                    kind: acc.kind(),
                    value: acc.snapshot_value(&self.index, timestamp, None),
                })
                .collect();
            manifest.trees.push(TreeManifest {
                id: tree.id(),
                name: tree.name().to_string(),
                created_at: tree.created_at(),
                accumulators,
            });
        }

        let entries = builder.entry_count();
        builder.finish(&manifest)?;
        let info = self.journal.checkpoint(timestamp, base)?;
        let images_deleted = snapshot::delete_older_than(&self.checkpoint_dir, timestamp)?;
        info!(
            timestamp,
            base,
            entries,
            trees = manifest.trees.len(),
            images_deleted,
            "checkpoint complete"
        );
        Ok(info)
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Apply the plan's committed transactions in commit order, creating
    /// trees as their creation timestamps come up
    fn replay(&self, plan: &RecoveryPlan) -> Result<RecoveryStats> {
        let mut stats = plan.stats.clone();
        let mut trees = plan.trees.iter().peekable();

        for txn in &plan.transactions {
            let commit_ts = txn.commit_ts.unwrap_or(txn.start_ts);
            while let Some(tree) = trees.next_if(|t| t.timestamp < commit_ts) {
                self.replay_create_tree(tree, &mut stats);
            }
            self.replay_transaction(txn, commit_ts, &mut stats)?;
        }
        for tree in trees {
            self.replay_create_tree(tree, &mut stats);
        }

        if !plan.transactions.is_empty() || !plan.trees.is_empty() {
            info!(
                transactions = plan.transactions.len(),
                applied = stats.applied_updates,
                failed = stats.failed_updates,
                "journal replayed"
            );
        }
        Ok(stats)
    }

    fn replay_create_tree(&self, tree: &RecoveredTree, stats: &mut RecoveryStats) {
        if self.store.tree(tree.tree_id).is_some() {
            return;
        }
        match self.store.insert_tree(tree.tree_id, &tree.name, tree.timestamp) {
            Ok(_) => debug!(tree_id = tree.tree_id, name = %tree.name, "tree recreated"),
            Err(e) => {
                warn!(address = tree.address, error = %e, "could not recreate tree");
                stats.failed_updates += 1;
            }
        }
    }

    fn replay_transaction(
        &self,
        txn: &RecoveredTransaction,
        commit_ts: u64,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        let status = self.index.register_recovered(txn.start_ts);
        let mut accumulators: Vec<Arc<Accumulator>> = Vec::new();
        let mut removed_trees = Vec::new();

        for (address, op) in &txn.ops {
            match self.apply_replay_op(&status, op, &mut accumulators, &mut removed_trees) {
                Ok(()) => stats.applied_updates += 1,
                Err(e @ (KeelError::TreeNotFound(_) | KeelError::InvalidState(_))) => {
                    debug!(address, op = op.name(), error = %e, "update not applied");
                    stats.failed_updates += 1;
                }
                Err(e) => return Err(e),
            }
        }

        for acc in &accumulators {
            acc.stamp_commit(txn.start_ts, commit_ts);
        }
        for tree_id in removed_trees {
            self.store.remove_tree(tree_id);
        }
        self.index.complete_recovered(&status, commit_ts);
        Ok(())
    }

    /// Apply one recovered update through the live write paths
    fn apply_replay_op(
        &self,
        status: &TransactionStatus,
        op: &ReplayOp,
        accumulators: &mut Vec<Arc<Accumulator>>,
        removed_trees: &mut Vec<TreeId>,
    ) -> Result<()> {
        match op {
            ReplayOp::Store {
                tree_id,
                step,
                key,
                value,
            } => {
                let tree = self.tree(*tree_id)?;
                self.write_version(status, &tree, key, WriteIntent::Value(value), *step, None)?;
            }
            ReplayOp::RemoveRange {
                tree_id,
                step,
                keys,
            } => {
                let tree = self.tree(*tree_id)?;
                for key in keys {
                    self.write_version(status, &tree, key, WriteIntent::AntiValue, *step, None)?;
                }
            }
            ReplayOp::RemoveTree { tree_id } => {
                self.tree(*tree_id)?;
                removed_trees.push(*tree_id);
            }
            ReplayOp::AccumulatorDelta {
                tree_id,
                index,
                kind,
                value,
            } => {
                let tree = self.tree(*tree_id)?;
                let acc = tree.accumulator(*index, *kind, kind.initial_value())?;
                acc.delta(status.ts(), *value);
                accumulators.push(acc);
            }
        }
        Ok(())
    }
}

/// Install the trees, values and accumulators of a checkpoint image
fn load_image(store: &PageStore, path: &Path) -> Result<()> {
    let image = SnapshotReader::open(path)?;
    let manifest = image.manifest();

    for tree in &manifest.trees {
        let installed = store.insert_tree(tree.id, &tree.name, tree.created_at)?;
        for acc in &tree.accumulators {
            installed.accumulator(acc.index, acc.kind, acc.value)?;
        }
    }
    store.reserve_tree_id(manifest.next_tree_id.saturating_sub(1));

    for entry in image.entries() {
        let entry = entry?;
        let tree = store.tree(entry.tree_id).ok_or_else(|| KeelError::BadImage {
            path: path.display().to_string(),
            reason: format!("entry for unknown tree {}", entry.tree_id),
        })?;
        let mut page = tree.acquire(tree.page_for(entry.key));
        page.write_mvv_record(
            entry.key,
            encode(&[Version {
                vh: PRIMORDIAL,
                payload: Payload::Value(entry.value),
            }]),
        );
    }

    info!(
        path = %path.display(),
        timestamp = image.timestamp(),
        entries = image.entry_count(),
        trees = manifest.trees.len(),
        "checkpoint image loaded"
    );
    Ok(())
}
