//! Version handles
//!
//! A version handle packs a start timestamp and a step into one `u64`:
//! `(timestamp << 8) | step`. Handle 0 is the primordial version.

/// Handle of a version visible to every reader
pub const PRIMORDIAL: u64 = 0;

/// Commit timestamp reported for a version whose owner has not committed
pub const UNCOMMITTED: u64 = u64::MAX;

/// Commit timestamp reported for a version whose owner aborted
pub const ABORTED: u64 = u64::MAX - 1;

/// Largest timestamp representable in a version handle
pub const MAX_TIMESTAMP: u64 = u64::MAX >> 8;

pub fn ts_to_vh(ts: u64, step: u8) -> u64 {
    debug_assert!(ts <= MAX_TIMESTAMP, "timestamp {} overflows a version handle", ts);
    (ts << 8) | step as u64
}

pub fn vh_to_ts(vh: u64) -> u64 {
    vh >> 8
}

pub fn vh_to_step(vh: u64) -> u8 {
    (vh & 0xFF) as u8
}
