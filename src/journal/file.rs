//! Journal file naming and file header

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};

use super::{FILE_HEADER_SIZE, FILE_MAGIC, FILE_VERSION};

const FILE_PREFIX: &str = "journal.";
const TEMP_SUFFIX: &str = ".tmp";

/// Header at offset 0 of every journal file
///
/// ```text
/// ┌───────────┬─────────────┬──────────────┬────────────────┬────────────────┬─────────┬─────────┐
/// │ Magic (4) │ Version (2) │ Reserved (2) │ Generation (8) │ BlockSize (8)  │ CRC (4) │ Pad (4) │
/// └───────────┴─────────────┴──────────────┴────────────────┴────────────────┴─────────┴─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub generation: u64,
    pub block_size: u64,
}

impl FileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILE_HEADER_SIZE as usize);
        out.put_slice(FILE_MAGIC);
        out.put_u16_le(FILE_VERSION);
        out.put_u16_le(0);
        out.put_u64_le(self.generation);
        out.put_u64_le(self.block_size);
        let crc = crc32fast::hash(&out);
        out.put_u32_le(crc);
        out.put_u32_le(0);
        out
    }

    /// Decode and validate; `Err` carries the reason the header is unusable
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < FILE_HEADER_SIZE as usize {
            return Err(format!("file header truncated at {} bytes", bytes.len()));
        }
        if &bytes[..4] != FILE_MAGIC {
            return Err("bad magic".to_string());
        }
        let mut buf = &bytes[4..];
        let version = buf.get_u16_le();
        let _reserved = buf.get_u16_le();
        let generation = buf.get_u64_le();
        let block_size = buf.get_u64_le();
        let stored_crc = buf.get_u32_le();
        if version != FILE_VERSION {
            return Err(format!("unsupported journal version {}", version));
        }
        let computed_crc = crc32fast::hash(&bytes[..24]);
        if stored_crc != computed_crc {
            return Err("file header CRC mismatch".to_string());
        }
        if block_size <= FILE_HEADER_SIZE {
            return Err(format!("block size {} too small", block_size));
        }
        Ok(Self {
            generation,
            block_size,
        })
    }

    /// Journal address of the first record in the file
    pub fn first_address(&self) -> u64 {
        self.generation * self.block_size + FILE_HEADER_SIZE
    }
}

/// `{dir}/journal.{generation:012}`
pub fn journal_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{}{:012}", FILE_PREFIX, generation))
}

pub fn temp_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{}{:012}{}", FILE_PREFIX, generation, TEMP_SUFFIX))
}

/// Generation of a finished journal file; temporary files never parse
pub fn parse_generation(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix(FILE_PREFIX)?;
    if digits.len() != 12 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(TEMP_SUFFIX))
}

/// Every finished journal file in `dir`, ordered by generation
pub fn list_journal_files(dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(generation) = parse_generation(&path) {
                files.push((generation, path));
            }
        }
    }
    files.sort();
    Ok(files)
}
