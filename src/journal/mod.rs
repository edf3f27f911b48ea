//! Journal Module
//!
//! Append-only write-ahead log; the durability boundary of the engine.
//!
//! ## Responsibilities
//! - Append records for every mutation before commit is reported
//! - CRC32 checksum per record for torn write and corruption detection
//! - Roll over to a new file at the block size boundary
//! - Track transactions with records in the journal (the live map)
//! - Checkpoint records and deletion of journal files recovery no longer needs
//!
//! ## Layout
//! ```text
//! {data_dir}/journal/journal.000000000000
//! ┌──────────────────────────────────────────────────────────────┐
//! │ File Header (32)                                             │
//! │   Magic "KJNL" | Version | Generation | BlockSize | CRC      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record                                                       │
//! │ ┌─────────┬─────────┬───────────┬─────────────┬─────┬─────┐  │
//! │ │ Type(1) │ Len (4) │ TxnId (8) │ Address (8) │ ... │ CRC │  │
//! │ └─────────┴─────────┴───────────┴─────────────┴─────┴─────┘  │
//! │ ... records never cross the block boundary ...              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//! Journal address = `generation * block_size + offset in file`.

mod file;
mod flusher;
mod manager;
mod reader;
mod record;
mod writer;

pub use file::{journal_path, list_journal_files, parse_generation, FileHeader};
pub use flusher::{FlusherStatsSnapshot, JournalFlusher};
pub use manager::{CheckpointInfo, JournalManager, JournalStatsSnapshot, TransactionMapItem};
pub use reader::{FileScan, JournalReader, JournalScan, ScanStop, TornTail};
pub use record::{peek_header, JournalEntry, JournalRecord, RecordHeader, NO_TRANSACTION};
pub use writer::JournalWriter;
pub(crate) use writer::sync_dir;

// =============================================================================
// Shared Constants
// =============================================================================

/// Magic bytes identifying a KeelKV journal file
pub(crate) const FILE_MAGIC: &[u8; 4] = b"KJNL";

/// Current journal format version
pub(crate) const FILE_VERSION: u16 = 1;

/// File header size; the first record starts here
pub const FILE_HEADER_SIZE: u64 = 32;

/// Type (1) + Length (4) + TxnId (8) + Address (8) = 21 bytes
pub const RECORD_HEADER_SIZE: usize = 21;

/// CRC32 trailer after the payload
pub const CRC_SIZE: usize = 4;
