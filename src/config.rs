//! Configuration for KeelKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{KeelError, Result};

/// Main configuration for a KeelKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── journal/         (journal.000000000000, journal.000000000001, ...)
    ///     └── checkpoints/     (checkpoint_000000001234.snap)
    pub data_dir: PathBuf,

    /// Number of latched pages backing each tree
    pub pages_per_tree: usize,

    /// Largest encoded MVV record a page accepts (bytes)
    pub max_record_size: usize,

    // -------------------------------------------------------------------------
    // Journal Configuration
    // -------------------------------------------------------------------------
    /// When a commit is reported durable
    pub commit_policy: CommitPolicy,

    /// Address span of one journal file; a file rolls over before exceeding it
    pub journal_block_size: u64,

    /// In-memory write buffer before bytes are handed to the OS
    pub journal_buffer_size: usize,

    /// How often the background flusher fsyncs under `CommitPolicy::Soft`
    pub flush_interval_ms: u64,

    // -------------------------------------------------------------------------
    // Transaction Configuration
    // -------------------------------------------------------------------------
    /// Number of lock stripes in the transaction status table
    pub status_shards: usize,

    /// Default wait budget for write-write dependencies and `lock()`
    pub lock_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Background Configuration
    // -------------------------------------------------------------------------
    /// Period of the cleanup manager (pruning, aging out, accumulator fold-in)
    pub cleanup_interval_ms: u64,

    /// Period of automatic checkpoints; 0 disables them
    pub checkpoint_interval_ms: u64,
}

/// Journal commit durability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Commit returns after the record is written; the flusher fsyncs later.
    /// Commits inside the last `flush_interval_ms` may be lost on a crash.
    Soft,

    /// Commit blocks until the journal is fsynced
    Hard,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./keelkv_data"),
            pages_per_tree: 64,
            max_record_size: 16 * 1024,
            commit_policy: CommitPolicy::Hard,
            journal_block_size: 64 * 1024 * 1024, // 64 MB
            journal_buffer_size: 256 * 1024,
            flush_interval_ms: 100,
            status_shards: 32,
            lock_timeout_ms: 60_000,
            cleanup_interval_ms: 1_000,
            checkpoint_interval_ms: 0,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pages_per_tree == 0 {
            return Err(KeelError::Config("pages_per_tree must be at least 1".into()));
        }
        if self.status_shards == 0 {
            return Err(KeelError::Config("status_shards must be at least 1".into()));
        }
        if self.max_record_size < 64 {
            return Err(KeelError::Config(format!(
                "max_record_size {} is below the 64 byte minimum",
                self.max_record_size
            )));
        }
        if self.journal_block_size < 4096 {
            return Err(KeelError::Config(format!(
                "journal_block_size {} is below the 4096 byte minimum",
                self.journal_block_size
            )));
        }
        if self.flush_interval_ms == 0 || self.cleanup_interval_ms == 0 {
            return Err(KeelError::Config("intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the number of pages per tree
    pub fn pages_per_tree(mut self, count: usize) -> Self {
        self.config.pages_per_tree = count;
        self
    }

    /// Set the maximum encoded record size (in bytes)
    pub fn max_record_size(mut self, size: usize) -> Self {
        self.config.max_record_size = size;
        self
    }

    /// Set the commit durability policy
    pub fn commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.config.commit_policy = policy;
        self
    }

    /// Set the journal file rollover threshold (in bytes)
    pub fn journal_block_size(mut self, size: u64) -> Self {
        self.config.journal_block_size = size;
        self
    }

    /// Set the journal write buffer size (in bytes)
    pub fn journal_buffer_size(mut self, size: usize) -> Self {
        self.config.journal_buffer_size = size;
        self
    }

    /// Set the soft-commit flush interval (in milliseconds)
    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.flush_interval_ms = ms;
        self
    }

    /// Set the number of status table stripes
    pub fn status_shards(mut self, count: usize) -> Self {
        self.config.status_shards = count;
        self
    }

    /// Set the default lock wait budget (in milliseconds)
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = ms;
        self
    }

    /// Set the cleanup manager period (in milliseconds)
    pub fn cleanup_interval_ms(mut self, ms: u64) -> Self {
        self.config.cleanup_interval_ms = ms;
        self
    }

    /// Set the automatic checkpoint period (in milliseconds, 0 disables)
    pub fn checkpoint_interval_ms(mut self, ms: u64) -> Self {
        self.config.checkpoint_interval_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
