//! Journal Flusher
//!
//! Background thread that fsyncs the journal every flush interval. Under
//! `CommitPolicy::Soft` it bounds how far durability lags behind commits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use tracing::{debug, error, warn};

use crate::error::Result;

use super::JournalManager;

/// Counters for the flusher thread
#[derive(Debug, Default)]
pub struct FlusherStats {
    pub flushes: AtomicU64,
    pub failures: AtomicU64,
}

/// Point-in-time copy of `FlusherStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlusherStatsSnapshot {
    pub flushes: u64,
    pub failures: u64,
}

impl FlusherStats {
    pub fn snapshot(&self) -> FlusherStatsSnapshot {
        FlusherStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle on the running flusher; stops the thread when dropped
pub struct JournalFlusher {
    /// Sends whether to flush once more before exiting
    shutdown: Option<Sender<bool>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<FlusherStats>,
}

impl JournalFlusher {
    pub fn spawn(journal: Arc<JournalManager>, interval: Duration) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<bool>(1);
        let stats = Arc::new(FlusherStats::default());
        let thread_stats = Arc::clone(&stats);

        let handle = std::thread::Builder::new()
            .name("keelkv-journal-flusher".into())
            .spawn(move || {
                let ticker = channel::tick(interval);
                let final_flush = loop {
                    channel::select! {
                        recv(shutdown_rx) -> msg => break msg.unwrap_or(true),
                        recv(ticker) -> _ => {
                            match journal.force() {
                                Ok(()) => {
                                    thread_stats.flushes.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    thread_stats.failures.fetch_add(1, Ordering::Relaxed);
                                    warn!(error = %e, "journal flush failed");
                                }
                            }
                        }
                    }
                };
                if final_flush {
                    if let Err(e) = journal.force() {
                        error!(error = %e, "final journal flush failed");
                    }
                }
                debug!(final_flush, "journal flusher stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            stats,
        })
    }

    pub fn stats(&self) -> FlusherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the thread after one last flush
    pub fn stop(&mut self) {
        self.shut_down(true);
    }

    /// Stop the thread without flushing. Records still buffered stay out
    /// of the journal file, as they would after a process crash.
    pub fn abort(&mut self) {
        self.shut_down(false);
    }

    fn shut_down(&mut self, final_flush: bool) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(final_flush);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("journal flusher panicked");
            }
        }
    }
}

impl Drop for JournalFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}
