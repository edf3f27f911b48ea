//! Cleanup Manager
//!
//! Background thread for work no transaction should wait on:
//! - prune page records whose versions no reader can see
//! - fold committed accumulator deltas into their base values
//! - age out transaction statuses
//! - take periodic checkpoints when configured

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use tracing::{debug, error, warn};

use crate::engine::EngineCore;
use crate::error::Result;

/// Work done by one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupPassStats {
    pub pages_pruned: u64,
    pub versions_removed: u64,
    pub keys_removed: u64,
    pub deltas_folded: u64,
    pub statuses_aged: u64,
}

#[derive(Debug, Default)]
struct CleanupStats {
    passes: AtomicU64,
    pages_pruned: AtomicU64,
    versions_removed: AtomicU64,
    keys_removed: AtomicU64,
    deltas_folded: AtomicU64,
    statuses_aged: AtomicU64,
    checkpoints: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the cleanup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStatsSnapshot {
    pub passes: u64,
    pub pages_pruned: u64,
    pub versions_removed: u64,
    pub keys_removed: u64,
    pub deltas_folded: u64,
    pub statuses_aged: u64,
    pub checkpoints: u64,
    pub errors: u64,
}

impl CleanupStats {
    fn record(&self, pass: &CleanupPassStats) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.pages_pruned.fetch_add(pass.pages_pruned, Ordering::Relaxed);
        self.versions_removed.fetch_add(pass.versions_removed, Ordering::Relaxed);
        self.keys_removed.fetch_add(pass.keys_removed, Ordering::Relaxed);
        self.deltas_folded.fetch_add(pass.deltas_folded, Ordering::Relaxed);
        self.statuses_aged.fetch_add(pass.statuses_aged, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CleanupStatsSnapshot {
        CleanupStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            pages_pruned: self.pages_pruned.load(Ordering::Relaxed),
            versions_removed: self.versions_removed.load(Ordering::Relaxed),
            keys_removed: self.keys_removed.load(Ordering::Relaxed),
            deltas_folded: self.deltas_folded.load(Ordering::Relaxed),
            statuses_aged: self.statuses_aged.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle on the cleanup thread; stops it when dropped
pub(crate) struct CleanupManager {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<CleanupStats>,
}

impl CleanupManager {
    pub(crate) fn spawn(core: Arc<EngineCore>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let stats = Arc::new(CleanupStats::default());
        let thread_stats = Arc::clone(&stats);
        let interval = core.config.cleanup_interval();
        let checkpoint_every = match core.config.checkpoint_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let handle = std::thread::Builder::new()
            .name("keelkv-cleanup".into())
            .spawn(move || {
                let ticker = channel::tick(interval);
                let mut last_checkpoint = Instant::now();
                loop {
                    channel::select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            run_pass(&core, &thread_stats);
                            let due = checkpoint_every
                                .is_some_and(|every| last_checkpoint.elapsed() >= every);
                            if due {
                                last_checkpoint = Instant::now();
                                match core.checkpoint() {
                                    Ok(_) => {
                                        thread_stats.checkpoints.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        thread_stats.errors.fetch_add(1, Ordering::Relaxed);
                                        warn!(error = %e, "periodic checkpoint failed");
                                    }
                                }
                            }
                        }
                    }
                }
                debug!("cleanup manager stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            stats,
        })
    }

    pub(crate) fn stats(&self) -> CleanupStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("cleanup manager panicked");
            }
        }
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pass(core: &EngineCore, stats: &CleanupStats) {
    match core.cleanup_pass() {
        Ok(pass) => {
            if pass != CleanupPassStats::default() {
                debug!(
                    pages = pass.pages_pruned,
                    versions = pass.versions_removed,
                    keys = pass.keys_removed,
                    deltas = pass.deltas_folded,
                    statuses = pass.statuses_aged,
                    "cleanup pass"
                );
            }
            stats.record(&pass);
        }
        Err(e) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "cleanup pass failed");
        }
    }
}
