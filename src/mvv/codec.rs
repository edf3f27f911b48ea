//! MVV Codec
//!
//! Encodes several versions of one key's value into a single record and
//! walks them back out without copying.

use bytes::{Buf, BufMut};

use crate::error::{KeelError, Result};
use crate::txn::TransactionIndex;

use super::handle::PRIMORDIAL;
use super::{ANTIVALUE_MARKER, ENTRY_HEADER_SIZE, MVV_TYPE};

/// Payload of one version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Value(&'a [u8]),
    /// The key was removed as of this version
    AntiValue,
}

impl<'a> Payload<'a> {
    pub fn as_value(self) -> Option<&'a [u8]> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::AntiValue => None,
        }
    }

    fn encoded_len(self) -> usize {
        ENTRY_HEADER_SIZE + self.as_value().map_or(0, <[u8]>::len)
    }
}

/// One `(version handle, payload)` pair borrowed from a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version<'a> {
    pub vh: u64,
    pub payload: Payload<'a>,
}

/// Lazy, restartable walk over the versions of a record in ascending order
pub struct VersionIter<'a> {
    record: &'a [u8],
    offset: usize,
    last_vh: Option<u64>,
    bad_type: bool,
    done: bool,
}

impl<'a> Iterator for VersionIter<'a> {
    type Item = Result<Version<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.bad_type {
            self.done = true;
            return Some(Err(KeelError::MalformedRecord(format!(
                "record does not start with MVV type byte {:#04x}",
                MVV_TYPE
            ))));
        }
        if self.offset >= self.record.len() {
            self.done = true;
            return None;
        }

        let decoded = decode_entry(self.record, self.offset).and_then(|(version, next)| {
            match self.last_vh {
                Some(last) if version.vh <= last => Err(KeelError::MalformedRecord(format!(
                    "version handle {:#x} follows {:#x}",
                    version.vh, last
                ))),
                _ => Ok((version, next)),
            }
        });
        match decoded {
            Ok((version, next)) => {
                self.offset = next;
                self.last_vh = Some(version.vh);
                Some(Ok(version))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterate the versions of `record`; an empty record has none
pub fn versions(record: &[u8]) -> VersionIter<'_> {
    VersionIter {
        record,
        offset: 1,
        last_vh: None,
        bad_type: record.first().is_some_and(|&b| b != MVV_TYPE),
        done: false,
    }
}

/// Decode every version, failing on the first malformed entry
pub fn decode(record: &[u8]) -> Result<Vec<Version<'_>>> {
    versions(record).collect()
}

/// Encode versions (already in ascending handle order) into a record
pub fn encode(versions: &[Version<'_>]) -> Vec<u8> {
    if versions.is_empty() {
        return Vec::new();
    }
    let size = 1 + versions.iter().map(|v| v.payload.encoded_len()).sum::<usize>();
    let mut out = Vec::with_capacity(size);
    out.put_u8(MVV_TYPE);
    for version in versions {
        out.put_u64_le(version.vh);
        match version.payload {
            Payload::Value(value) => {
                out.put_u32_le(value.len() as u32);
                out.put_slice(value);
            }
            Payload::AntiValue => out.put_u32_le(ANTIVALUE_MARKER),
        }
    }
    out
}

pub fn version_count(record: &[u8]) -> Result<usize> {
    versions(record).try_fold(0, |n, v| v.map(|_| n + 1))
}

/// True for a record holding exactly one primordial version
pub fn is_primordial(record: &[u8]) -> Result<bool> {
    let mut iter = versions(record);
    match (iter.next().transpose()?, iter.next()) {
        (Some(v), None) => Ok(v.vh == PRIMORDIAL),
        _ => Ok(false),
    }
}

/// Result of `store_version`
#[derive(Debug)]
pub struct StoreOutcome {
    pub record: Vec<u8>,
    /// False when an existing pair with the same handle was overwritten
    pub inserted: bool,
}

/// Insert or overwrite the pair for `vh`, keeping ascending order.
///
/// Fails with `RecordTooLong` when the new record exceeds `max_len`; the
/// caller owns converting it to a long record.
pub fn store_version(
    record: &[u8],
    vh: u64,
    payload: Payload<'_>,
    max_len: usize,
) -> Result<StoreOutcome> {
    let mut list = decode(record)?;
    let inserted = match list.binary_search_by_key(&vh, |v| v.vh) {
        Ok(pos) => {
            list[pos].payload = payload;
            false
        }
        Err(pos) => {
            list.insert(pos, Version { vh, payload });
            true
        }
    };

    let record = encode(&list);
    if record.len() > max_len {
        return Err(KeelError::RecordTooLong {
            size: record.len(),
            limit: max_len,
        });
    }
    Ok(StoreOutcome { record, inserted })
}

/// The payload visible to an observer at `(ts, step)`: the highest version
/// the index reports as committed for that observer. `None` means the
/// observer sees no version at all.
pub fn fetch_visible<'a>(
    record: &'a [u8],
    index: &TransactionIndex,
    ts: u64,
    step: u8,
) -> Result<Option<Payload<'a>>> {
    let mut visible = None;
    for version in versions(record) {
        let version = version?;
        if version.vh == PRIMORDIAL || index.commit_status(version.vh, ts, step).is_visible() {
            visible = Some(version.payload);
        }
    }
    Ok(visible)
}

// =============================================================================
// Private Helpers
// =============================================================================

fn decode_entry(record: &[u8], offset: usize) -> Result<(Version<'_>, usize)> {
    let mut buf = record
        .get(offset..)
        .filter(|rest| rest.len() >= ENTRY_HEADER_SIZE)
        .ok_or_else(|| {
            KeelError::MalformedRecord(format!("truncated version header at offset {}", offset))
        })?;
    let vh = buf.get_u64_le();
    let len = buf.get_u32_le();
    let start = offset + ENTRY_HEADER_SIZE;

    if len == ANTIVALUE_MARKER {
        return Ok((
            Version {
                vh,
                payload: Payload::AntiValue,
            },
            start,
        ));
    }

    let end = start + len as usize;
    let value = record.get(start..end).ok_or_else(|| {
        KeelError::MalformedRecord(format!(
            "version {:#x} claims {} bytes, {} available",
            vh,
            len,
            record.len() - start
        ))
    })?;
    Ok((
        Version {
            vh,
            payload: Payload::Value(value),
        },
        end,
    ))
}
