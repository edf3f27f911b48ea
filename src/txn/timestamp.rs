//! Timestamp Allocator
//!
//! Issues strictly increasing logical timestamps. Every ordering decision in
//! the engine (transaction starts, commits, checkpoints) reads this clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical clock shared by the transaction index, journal and checkpoints
#[derive(Debug)]
pub struct TimestampAllocator {
    current: AtomicU64,
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampAllocator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Clock whose next allocation is `ts + 1`
    pub fn starting_at(ts: u64) -> Self {
        Self {
            current: AtomicU64::new(ts),
        }
    }

    /// Allocate the next timestamp
    pub fn allocate(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Most recently allocated timestamp
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Allocate a timestamp used only to mark "now" (completion, cleanup)
    pub fn update_timestamp(&self) -> u64 {
        self.allocate()
    }

    /// Move the clock forward so the next allocation exceeds `ts`.
    /// Used by recovery after reading timestamps back from the journal.
    pub fn advance_to(&self, ts: u64) {
        self.current.fetch_max(ts, Ordering::SeqCst);
    }
}
