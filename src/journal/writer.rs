//! Journal Writer
//!
//! Appends serialized records to the current journal file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::{KeelError, Result};

use super::file::{journal_path, temp_path, FileHeader};
use super::FILE_HEADER_SIZE;

/// Writes records to one journal file
///
/// Addresses are global: `generation * block_size + offset`. A record never
/// spans two files; the manager rolls over before a record would cross the
/// block boundary.
///
/// Records collect in `pending` until the buffer fills or a flush is asked
/// for. A failed write truncates the file back to its last good length and
/// keeps `pending`, so the writer is never left misaligned.
pub struct JournalWriter {
    path: PathBuf,
    header: FileHeader,
    file: File,
    pending: BytesMut,
    buffer_size: usize,
    /// Bytes known to be in the file
    file_len: u64,
}

impl JournalWriter {
    /// Create journal file `generation` in `dir`.
    ///
    /// The file is built under a temporary name, its header fsynced, then
    /// renamed into place. A crash part way leaves only a temporary file,
    /// which recovery ignores.
    pub fn create(
        dir: &Path,
        generation: u64,
        block_size: u64,
        buffer_size: usize,
    ) -> Result<Self> {
        let header = FileHeader {
            generation,
            block_size,
        };
        let tmp = temp_path(dir, generation);
        let path = journal_path(dir, generation);
        if path.exists() {
            return Err(KeelError::Durability(format!(
                "journal file {} already exists",
                path.display()
            )));
        }

        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&header.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(dir)?;

        let file = OpenOptions::new().append(true).open(&path)?;
        debug!(generation, path = %path.display(), "journal file created");

        Ok(Self {
            path,
            header,
            file,
            pending: BytesMut::with_capacity(buffer_size),
            buffer_size,
            file_len: FILE_HEADER_SIZE,
        })
    }

    /// Append one serialized record at the current address.
    ///
    /// On error the record is not in the journal and earlier records are
    /// unaffected.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let address = self.current_address();
        let mark = self.pending.len();
        self.pending.extend_from_slice(bytes);
        if self.pending.len() >= self.buffer_size {
            if let Err(e) = self.flush() {
                self.pending.truncate(mark);
                return Err(e);
            }
        }
        Ok(address)
    }

    /// Hand buffered bytes to the OS
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.file.write_all(&self.pending) {
            warn!(path = %self.path.display(), error = %e, "journal write failed");
            self.file.set_len(self.file_len)?;
            return Err(e.into());
        }
        self.file_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Flush and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Independent handle on the file, for fsync outside the journal lock
    pub fn file_handle(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    /// Whether `len` more bytes fit before the block boundary
    pub fn fits(&self, len: usize) -> bool {
        self.offset() + len as u64 <= self.header.block_size
    }

    pub fn current_address(&self) -> u64 {
        self.header.generation * self.header.block_size + self.offset()
    }

    /// Offset of the next record within the file
    fn offset(&self) -> u64 {
        self.file_len + self.pending.len() as u64
    }

    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    pub fn block_size(&self) -> u64 {
        self.header.block_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Make a rename or delete in `dir` durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
