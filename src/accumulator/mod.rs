//! Accumulator Module
//!
//! Transactional aggregates (sum, max, min, seq) attached to a tree. A
//! contribution is visible to its own transaction at once and to others only
//! after commit, with O(1) state per transaction instead of a version per
//! write.

mod kind;
mod value;

pub use kind::AccumulatorType;
pub use value::Accumulator;
