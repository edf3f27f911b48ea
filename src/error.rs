//! Error types for KeelKV
//!
//! Provides a unified error type for all operations. Conflict and timeout
//! errors are expected control flow: callers retry the whole transaction.

use thiserror::Error;

/// Result type alias using KeelError
pub type Result<T> = std::result::Result<T, KeelError>;

/// Unified error type for KeelKV operations
#[derive(Debug, Error)]
pub enum KeelError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    /// Write-write conflict, deadlock victim or explicit abort
    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    /// A lock or conflict wait exceeded its budget
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    // -------------------------------------------------------------------------
    // Journal Errors
    // -------------------------------------------------------------------------
    /// Journal append or flush failed; the transaction cannot commit
    #[error("Durability failure: {0}")]
    Durability(String),

    /// Invariant violated while reading the journal or a checkpoint image
    #[error("Corruption at journal address {address}: {reason}")]
    Corruption { address: u64, reason: String },

    /// A checkpoint image is missing, truncated or fails its checksum
    #[error("Bad checkpoint image {path}: {reason}")]
    BadImage { path: String, reason: String },

    // -------------------------------------------------------------------------
    // Record Errors
    // -------------------------------------------------------------------------
    #[error("Malformed MVV record: {0}")]
    MalformedRecord(String),

    #[error("Record too long: {size} bytes exceeds limit of {limit}")]
    RecordTooLong { size: usize, limit: usize },

    // -------------------------------------------------------------------------
    // Tree Errors
    // -------------------------------------------------------------------------
    #[error("Tree not found: {0}")]
    TreeNotFound(String),

    #[error("Tree already exists: {0}")]
    TreeExists(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KeelError {
    /// True for errors a caller should handle by retrying the transaction
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeelError::Rollback(_) | KeelError::Timeout(_))
    }

    pub(crate) fn corruption(address: u64, reason: impl Into<String>) -> Self {
        KeelError::Corruption {
            address,
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for KeelError {
    fn from(e: bincode::Error) -> Self {
        KeelError::Serialization(e.to_string())
    }
}
