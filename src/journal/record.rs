//! Journal record definitions
//!
//! Defines the records written to the journal and their byte layout.

use bytes::{Buf, BufMut};

use crate::accumulator::AccumulatorType;
use crate::error::{KeelError, Result};

use super::{CRC_SIZE, RECORD_HEADER_SIZE};

// =============================================================================
// Record Type Codes
// =============================================================================

const TYPE_BEGIN: u8 = 1;
const TYPE_STORE: u8 = 2;
const TYPE_REMOVE_RANGE: u8 = 3;
const TYPE_CREATE_TREE: u8 = 4;
const TYPE_REMOVE_TREE: u8 = 5;
const TYPE_ACCUMULATOR_DELTA: u8 = 6;
const TYPE_COMMIT: u8 = 7;
const TYPE_ROLLBACK: u8 = 8;
const TYPE_CHECKPOINT: u8 = 9;

/// Transaction id of records that belong to no transaction
pub const NO_TRANSACTION: u64 = 0;

/// Records that can be journaled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// First record of a transaction that writes
    BeginTransaction { start_ts: u64 },

    /// Store a value under `key`
    Store {
        tree_id: u32,
        step: u8,
        key: Vec<u8>,
        value: Vec<u8>,
    },

    /// Remove within `[from, to)`. `keys` are exactly the keys that held a
    /// value visible to the transaction and now carry its AntiValue.
    RemoveRange {
        tree_id: u32,
        step: u8,
        from: Vec<u8>,
        to: Vec<u8>,
        keys: Vec<Vec<u8>>,
    },

    /// Create a tree; never part of a transaction
    CreateTree {
        tree_id: u32,
        timestamp: u64,
        name: String,
    },

    /// Remove a tree and its accumulators when the transaction commits
    RemoveTree { tree_id: u32 },

    /// Final pending delta of one accumulator, written before Commit
    AccumulatorDelta {
        tree_id: u32,
        index: u32,
        kind: AccumulatorType,
        value: i64,
    },

    Commit { commit_ts: u64 },

    Rollback,

    /// Recovery may start at `base_address`; everything committed at or
    /// before `timestamp` is in the checkpoint image
    Checkpoint { timestamp: u64, base_address: u64 },
}

impl JournalRecord {
    pub fn type_code(&self) -> u8 {
        match self {
            JournalRecord::BeginTransaction { .. } => TYPE_BEGIN,
            JournalRecord::Store { .. } => TYPE_STORE,
            JournalRecord::RemoveRange { .. } => TYPE_REMOVE_RANGE,
            JournalRecord::CreateTree { .. } => TYPE_CREATE_TREE,
            JournalRecord::RemoveTree { .. } => TYPE_REMOVE_TREE,
            JournalRecord::AccumulatorDelta { .. } => TYPE_ACCUMULATOR_DELTA,
            JournalRecord::Commit { .. } => TYPE_COMMIT,
            JournalRecord::Rollback => TYPE_ROLLBACK,
            JournalRecord::Checkpoint { .. } => TYPE_CHECKPOINT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JournalRecord::BeginTransaction { .. } => "BeginTransaction",
            JournalRecord::Store { .. } => "Store",
            JournalRecord::RemoveRange { .. } => "RemoveRange",
            JournalRecord::CreateTree { .. } => "CreateTree",
            JournalRecord::RemoveTree { .. } => "RemoveTree",
            JournalRecord::AccumulatorDelta { .. } => "AccumulatorDelta",
            JournalRecord::Commit { .. } => "Commit",
            JournalRecord::Rollback => "Rollback",
            JournalRecord::Checkpoint { .. } => "Checkpoint",
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            JournalRecord::BeginTransaction { start_ts } => out.put_u64_le(*start_ts),
            JournalRecord::Store {
                tree_id,
                step,
                key,
                value,
            } => {
                out.put_u32_le(*tree_id);
                out.put_u8(*step);
                put_bytes(out, key);
                put_bytes(out, value);
            }
            JournalRecord::RemoveRange {
                tree_id,
                step,
                from,
                to,
                keys,
            } => {
                out.put_u32_le(*tree_id);
                out.put_u8(*step);
                put_bytes(out, from);
                put_bytes(out, to);
                out.put_u32_le(keys.len() as u32);
                for key in keys {
                    put_bytes(out, key);
                }
            }
            JournalRecord::CreateTree {
                tree_id,
                timestamp,
                name,
            } => {
                out.put_u32_le(*tree_id);
                out.put_u64_le(*timestamp);
                put_bytes(out, name.as_bytes());
            }
            JournalRecord::RemoveTree { tree_id } => out.put_u32_le(*tree_id),
            JournalRecord::AccumulatorDelta {
                tree_id,
                index,
                kind,
                value,
            } => {
                out.put_u32_le(*tree_id);
                out.put_u32_le(*index);
                out.put_u8(kind.code());
                out.put_i64_le(*value);
            }
            JournalRecord::Commit { commit_ts } => out.put_u64_le(*commit_ts),
            JournalRecord::Rollback => {}
            JournalRecord::Checkpoint {
                timestamp,
                base_address,
            } => {
                out.put_i64_le(*timestamp as i64);
                out.put_i64_le(*base_address as i64);
            }
        }
    }

    fn decode_payload(type_code: u8, mut buf: &[u8]) -> std::result::Result<Self, String> {
        let record = match type_code {
            TYPE_BEGIN => JournalRecord::BeginTransaction {
                start_ts: get_u64(&mut buf)?,
            },
            TYPE_STORE => JournalRecord::Store {
                tree_id: get_u32(&mut buf)?,
                step: get_u8(&mut buf)?,
                key: get_bytes(&mut buf)?,
                value: get_bytes(&mut buf)?,
            },
            TYPE_REMOVE_RANGE => {
                let tree_id = get_u32(&mut buf)?;
                let step = get_u8(&mut buf)?;
                let from = get_bytes(&mut buf)?;
                let to = get_bytes(&mut buf)?;
                let count = get_u32(&mut buf)? as usize;
                // Each key costs at least its 4 byte length
                if count > buf.remaining() / 4 {
                    return Err(format!("remove range claims {} keys", count));
                }
                let keys = (0..count)
                    .map(|_| get_bytes(&mut buf))
                    .collect::<std::result::Result<_, _>>()?;
                JournalRecord::RemoveRange {
                    tree_id,
                    step,
                    from,
                    to,
                    keys,
                }
            }
            TYPE_CREATE_TREE => JournalRecord::CreateTree {
                tree_id: get_u32(&mut buf)?,
                timestamp: get_u64(&mut buf)?,
                name: String::from_utf8(get_bytes(&mut buf)?)
                    .map_err(|e| format!("tree name is not UTF-8: {}", e))?,
            },
            TYPE_REMOVE_TREE => JournalRecord::RemoveTree {
                tree_id: get_u32(&mut buf)?,
            },
            TYPE_ACCUMULATOR_DELTA => JournalRecord::AccumulatorDelta {
                tree_id: get_u32(&mut buf)?,
                index: get_u32(&mut buf)?,
                kind: AccumulatorType::from_code(get_u8(&mut buf)?).map_err(|e| e.to_string())?,
                value: get_u64(&mut buf)? as i64,
            },
            TYPE_COMMIT => JournalRecord::Commit {
                commit_ts: get_u64(&mut buf)?,
            },
            TYPE_ROLLBACK => JournalRecord::Rollback,
            TYPE_CHECKPOINT => JournalRecord::Checkpoint {
                timestamp: get_u64(&mut buf)?,
                base_address: get_u64(&mut buf)?,
            },
            other => return Err(format!("unknown record type {}", other)),
        };
        if buf.has_remaining() {
            return Err(format!("{} trailing payload bytes", buf.remaining()));
        }
        Ok(record)
    }
}

/// A record together with its transaction and its place in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Journal address of the first header byte
    pub address: u64,

    /// Owning transaction (its start timestamp) or `NO_TRANSACTION`
    pub txn_id: u64,

    pub record: JournalRecord,
}

impl JournalEntry {
    pub fn new(address: u64, txn_id: u64, record: JournalRecord) -> Self {
        Self {
            address,
            txn_id,
            record,
        }
    }

    /// Serialize: header, payload, CRC32 of both
    ///
    /// ```text
    /// ┌──────────┬────────────┬─────────────┬──────────────┬─────────┬─────────┐
    /// │ Type (1) │ Length (4) │ TxnId (i64) │ Address (i64)│ Payload │ CRC (4) │
    /// └──────────┴────────────┴─────────────┴──────────────┴─────────┴─────────┘
    /// ```
    /// Length counts every byte of the record, CRC included.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.record.encode_payload(&mut payload);

        let length = RECORD_HEADER_SIZE + payload.len() + CRC_SIZE;
        let mut out = Vec::with_capacity(length);
        out.put_u8(self.record.type_code());
        out.put_u32_le(length as u32);
        out.put_i64_le(self.txn_id as i64);
        out.put_i64_le(self.address as i64);
        out.put_slice(&payload);

        let crc = crc32fast::hash(&out);
        out.put_u32_le(crc);
        out
    }

    /// Decode one record from the start of `bytes`, which must hold the
    /// whole record. Returns the entry and its encoded length.
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = peek_header(bytes).ok_or_else(|| {
            KeelError::Serialization(format!("{} bytes cannot hold a record header", bytes.len()))
        })?;
        if header.length < RECORD_HEADER_SIZE + CRC_SIZE || header.length > bytes.len() {
            return Err(KeelError::corruption(
                header.address,
                format!("record length {} out of range", header.length),
            ));
        }

        let body_end = header.length - CRC_SIZE;
        let stored_crc = (&bytes[body_end..header.length]).get_u32_le();
        let computed_crc = crc32fast::hash(&bytes[..body_end]);
        if stored_crc != computed_crc {
            return Err(KeelError::corruption(
                header.address,
                format!(
                    "CRC mismatch: stored {:#010x}, computed {:#010x}",
                    stored_crc, computed_crc
                ),
            ));
        }

        let payload = &bytes[RECORD_HEADER_SIZE..body_end];
        let record = JournalRecord::decode_payload(header.type_code, payload)
            .map_err(|reason| KeelError::corruption(header.address, reason))?;
        Ok((
            Self {
                address: header.address,
                txn_id: header.txn_id,
                record,
            },
            header.length,
        ))
    }
}

/// Fixed-size header fields of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub type_code: u8,
    pub length: usize,
    pub txn_id: u64,
    pub address: u64,
}

/// Read a header without validating the rest of the record
pub fn peek_header(bytes: &[u8]) -> Option<RecordHeader> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let mut buf = bytes;
    Some(RecordHeader {
        type_code: buf.get_u8(),
        length: buf.get_u32_le() as usize,
        txn_id: buf.get_i64_le() as u64,
        address: buf.get_i64_le() as u64,
    })
}

// =============================================================================
// Private Helpers
// =============================================================================

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.put_u32_le(bytes.len() as u32);
    out.put_slice(bytes);
}

fn need(buf: &[u8], n: usize) -> std::result::Result<(), String> {
    if buf.remaining() < n {
        Err(format!("payload truncated: need {} bytes, have {}", n, buf.remaining()))
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut &[u8]) -> std::result::Result<u8, String> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> std::result::Result<u32, String> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8]) -> std::result::Result<u64, String> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut &[u8]) -> std::result::Result<Vec<u8>, String> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}
