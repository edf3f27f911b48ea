//! Journal Reader
//!
//! Reads records back from journal files, stopping at the first record that
//! is truncated or fails its checksum.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{KeelError, Result};

use super::file::{list_journal_files, FileHeader};
use super::record::{peek_header, JournalEntry};
use super::{CRC_SIZE, FILE_HEADER_SIZE, RECORD_HEADER_SIZE};

/// Why a file scan stopped before the end of the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStop {
    /// Address of the first unreadable byte
    pub address: u64,
    pub reason: String,
    /// Address of an intact record further on in the same file. A stop
    /// with readable records after it is damage, not a torn append.
    pub resumes_at: Option<u64>,
}

/// Records read from one journal file
#[derive(Debug)]
pub struct FileScan {
    pub path: PathBuf,
    pub header: FileHeader,
    pub entries: Vec<JournalEntry>,
    /// Length of the readable prefix of the file
    pub valid_len: u64,
    /// Total length of the file on disk
    pub file_len: u64,
    pub stop: Option<ScanStop>,
}

/// A torn final record left by a crash during append
#[derive(Debug, Clone)]
pub struct TornTail {
    pub path: PathBuf,
    pub generation: u64,
    /// File length to truncate to
    pub valid_len: u64,
    pub stop: ScanStop,
}

/// Every readable record of a journal directory
#[derive(Debug, Default)]
pub struct JournalScan {
    pub entries: Vec<JournalEntry>,
    /// Generations found, ascending
    pub generations: Vec<u64>,
    /// Block size recorded in the file headers
    pub block_size: Option<u64>,
    /// Address just past the last readable record
    pub end_address: u64,
    pub torn_tail: Option<TornTail>,
}

/// Reads journal files
pub struct JournalReader;

impl JournalReader {
    /// Read every record of one file up to the first unreadable one
    pub fn read_file(path: &Path) -> Result<FileScan> {
        let data = fs::read(path)?;
        let header = FileHeader::decode(&data).map_err(|reason| {
            KeelError::corruption(0, format!("{}: {}", path.display(), reason))
        })?;

        let base = header.generation * header.block_size;
        let mut offset = FILE_HEADER_SIZE as usize;
        let mut entries = Vec::new();
        let mut stop = None;

        while offset < data.len() {
            let address = base + offset as u64;
            let rest = &data[offset..];
            let reason = match peek_header(rest) {
                None => Some(format!("truncated record header ({} bytes)", rest.len())),
                Some(h) if h.length < RECORD_HEADER_SIZE + CRC_SIZE => {
                    Some(format!("record length {} too small", h.length))
                }
                Some(h) if h.length > rest.len() => Some(format!(
                    "record length {} exceeds the {} bytes remaining",
                    h.length,
                    rest.len()
                )),
                Some(h) if h.address != address => Some(format!(
                    "record claims address {}, found at {}",
                    h.address, address
                )),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                stop = Some(ScanStop {
                    address,
                    reason,
                    resumes_at: find_intact_record(&data, base, offset + 1),
                });
                break;
            }

            match JournalEntry::deserialize(rest) {
                Ok((entry, len)) => {
                    entries.push(entry);
                    offset += len;
                }
                Err(e) => {
                    stop = Some(ScanStop {
                        address,
                        reason: e.to_string(),
                        resumes_at: find_intact_record(&data, base, offset + 1),
                    });
                    break;
                }
            }
        }

        Ok(FileScan {
            path: path.to_path_buf(),
            header,
            entries,
            valid_len: offset as u64,
            file_len: data.len() as u64,
            stop,
        })
    }

    /// Read every journal file in `dir` in generation order.
    ///
    /// An unreadable record at the very end of the last file is a torn tail
    /// and ends the scan. One in any earlier file was fsynced before the
    /// next file was created, and one followed by intact records was
    /// damaged after it was written; both are corruption.
    pub fn scan(dir: &Path) -> Result<JournalScan> {
        let files = list_journal_files(dir)?;
        let mut scan = JournalScan::default();
        let last = files.len().saturating_sub(1);

        for (i, (generation, path)) in files.iter().enumerate() {
            let file = Self::read_file(path)?;
            if file.header.generation != *generation {
                return Err(KeelError::corruption(
                    file.header.first_address(),
                    format!(
                        "{} holds generation {}",
                        path.display(),
                        file.header.generation
                    ),
                ));
            }
            match scan.block_size {
                Some(bs) if bs != file.header.block_size => {
                    return Err(KeelError::corruption(
                        file.header.first_address(),
                        format!(
                            "{} has block size {}, expected {}",
                            path.display(),
                            file.header.block_size,
                            bs
                        ),
                    ));
                }
                _ => scan.block_size = Some(file.header.block_size),
            }

            debug!(
                generation,
                records = file.entries.len(),
                bytes = file.valid_len,
                "journal file scanned"
            );
            scan.end_address = file.header.generation * file.header.block_size + file.valid_len;
            scan.generations.push(*generation);
            scan.entries.extend(file.entries);

            if let Some(stop) = file.stop {
                if i != last {
                    return Err(KeelError::corruption(stop.address, stop.reason));
                }
                if let Some(next) = stop.resumes_at {
                    return Err(KeelError::corruption(
                        stop.address,
                        format!("{}; intact record follows at {}", stop.reason, next),
                    ));
                }
                warn!(
                    address = stop.address,
                    reason = %stop.reason,
                    "torn journal tail"
                );
                scan.torn_tail = Some(TornTail {
                    path: file.path,
                    generation: *generation,
                    valid_len: file.valid_len,
                    stop,
                });
            }
        }
        Ok(scan)
    }
}

/// Address of the first intact record starting at or after `from`.
///
/// Records carry their own address, so a match at a shifted offset is not
/// mistaken for one.
fn find_intact_record(data: &[u8], base: u64, from: usize) -> Option<u64> {
    for offset in from..data.len() {
        let rest = &data[offset..];
        let header = peek_header(rest)?;
        let address = base + offset as u64;
        if header.address != address
            || header.length < RECORD_HEADER_SIZE + CRC_SIZE
            || header.length > rest.len()
        {
            continue;
        }
        if JournalEntry::deserialize(rest).is_ok() {
            return Some(address);
        }
    }
    None
}
