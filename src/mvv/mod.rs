//! Multi-Version Value (MVV) Module
//!
//! One physical record holds every version of a key that some reader may
//! still need, each tagged with the version handle of the transaction that
//! wrote it.
//!
//! ## Record Format
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ Type (1)     │ 0xFE                                         │
//! ├──────────────┴──────────────────────────────────────────────┤
//! │ Version 1                                                   │
//! │ ┌──────────┬──────────┬──────────────┐                      │
//! │ │ VH (8)   │ Len (4)  │ Payload      │                      │
//! │ └──────────┴──────────┴──────────────┘                      │
//! │ ... ascending version handles ...                           │
//! │ (Len = u32::MAX marks an AntiValue, no payload bytes)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! An empty byte string is a record with zero versions: the key is absent.

mod codec;
pub mod handle;
mod prune;

pub use codec::{
    decode, encode, fetch_visible, is_primordial, store_version, version_count, versions,
    Payload, StoreOutcome, Version, VersionIter,
};
pub use prune::{prune, PruneOutcome};

// =============================================================================
// Shared Constants
// =============================================================================

/// First byte of every non-empty record
pub(crate) const MVV_TYPE: u8 = 0xFE;

/// Version handle (8) + payload length (4)
pub(crate) const ENTRY_HEADER_SIZE: usize = 12;

/// Payload length marking an AntiValue
pub(crate) const ANTIVALUE_MARKER: u32 = u32::MAX;
