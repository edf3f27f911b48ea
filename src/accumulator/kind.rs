//! Accumulator types and their combining rules

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

/// Aggregate maintained by an accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccumulatorType {
    /// Running total
    Sum,
    /// Largest value seen
    Max,
    /// Smallest value seen
    Min,
    /// Sequence counter; the latest committed writer wins
    Seq,
}

impl AccumulatorType {
    /// Combine an existing value with a new contribution
    pub fn combine(self, current: i64, delta: i64) -> i64 {
        match self {
            AccumulatorType::Sum => current.wrapping_add(delta),
            AccumulatorType::Max => current.max(delta),
            AccumulatorType::Min => current.min(delta),
            AccumulatorType::Seq => delta,
        }
    }

    /// Value of an accumulator nobody has contributed to
    pub fn initial_value(self) -> i64 {
        match self {
            AccumulatorType::Sum | AccumulatorType::Seq => 0,
            AccumulatorType::Max => i64::MIN,
            AccumulatorType::Min => i64::MAX,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            AccumulatorType::Sum => 0,
            AccumulatorType::Max => 1,
            AccumulatorType::Min => 2,
            AccumulatorType::Seq => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(AccumulatorType::Sum),
            1 => Ok(AccumulatorType::Max),
            2 => Ok(AccumulatorType::Min),
            3 => Ok(AccumulatorType::Seq),
            other => Err(KeelError::Serialization(format!(
                "unknown accumulator type code {}",
                other
            ))),
        }
    }
}
