//! Wire codec: statements <-> replication/recovery records.
//!
//! A record is the durable form of one statement. Encoding is lossy on
//! purpose: transient flags are masked out, and only the part of the
//! statement the target index needs survives (a secondary index gets the
//! extracted key, never the full row). Decoding rebuilds a heap
//! statement through the non-validating construction path, since
//! recovered bytes were validated when first written.

use std::sync::Arc;

use shrike_common::error::StmtError;
use shrike_common::types::{Lsn, SpaceId};

use crate::format::{Format, KeyDef};
use crate::msgpack::{self, MpRead};
use crate::stmt::build::{new_with_ops, HeapStmt, StmtEnv};
use crate::stmt::layout::{StmtFlags, StmtKind, StmtRead};
use crate::stmt::region::RegionArena;

/// Metadata map key carrying the persistent statement flags.
const META_PERSISTENT_FLAGS: u64 = 0x01;

/// Operation code of a wire record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordOp {
    Insert = 1,
    Replace = 2,
    Delete = 3,
    Upsert = 4,
}

impl RecordOp {
    pub fn from_u8(b: u8) -> Option<RecordOp> {
        match b {
            1 => Some(RecordOp::Insert),
            2 => Some(RecordOp::Replace),
            3 => Some(RecordOp::Delete),
            4 => Some(RecordOp::Upsert),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RecordOp::Insert => "INSERT",
            RecordOp::Replace => "REPLACE",
            RecordOp::Delete => "DELETE",
            RecordOp::Upsert => "UPSERT",
        }
    }
}

/// One encoded statement, ready for the log writer.
///
/// Exactly one of `key` / `tuple` is set, per the opcode; `ops` rides
/// along for upserts; `meta` is present only when some persistent flag
/// survived the mask.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireRecord {
    pub op: u8,
    pub lsn: Lsn,
    pub space_id: SpaceId,
    pub key: Option<Vec<u8>>,
    pub tuple: Option<Vec<u8>>,
    pub ops: Option<Vec<u8>>,
    pub meta: Option<Vec<u8>>,
}

fn encode_meta(flags: StmtFlags) -> Option<Vec<u8>> {
    if flags.is_empty() {
        return None;
    }
    let mut out = Vec::new();
    msgpack::write_map(&mut out, 1);
    msgpack::write_uint(&mut out, META_PERSISTENT_FLAGS);
    msgpack::write_uint(&mut out, u64::from(flags.bits()));
    Some(out)
}

/// Materialize a statement's key: its own payload when it already is a
/// bare key, otherwise extracted from the row through `key_def`.
fn record_key<S: StmtRead>(
    stmt: &S,
    key_def: &KeyDef,
    region: &mut RegionArena,
) -> Result<Vec<u8>, StmtError> {
    if stmt.is_key() {
        return Ok(stmt.payload().to_vec());
    }
    let svp = region.used();
    let res = key_def
        .extract_raw(stmt.tuple_data(), region)
        .map(|key| key.to_vec());
    region.truncate(svp);
    res
}

/// Encode a statement for the primary index.
///
/// The full row survives; `DEFERRED_DELETE` is persisted, the
/// write-iterator hint never is.
pub fn encode_primary<S: StmtRead>(
    stmt: &S,
    key_def: &KeyDef,
    space_id: SpaceId,
    region: &mut RegionArena,
) -> Result<WireRecord, StmtError> {
    let mut rec = WireRecord {
        lsn: stmt.lsn(),
        space_id,
        meta: encode_meta(stmt.flags().persistent(true)),
        ..WireRecord::default()
    };
    match stmt.kind() {
        StmtKind::Delete => {
            rec.op = RecordOp::Delete as u8;
            rec.key = Some(record_key(stmt, key_def, region)?);
        }
        StmtKind::Insert => {
            rec.op = RecordOp::Insert as u8;
            rec.tuple = Some(stmt.tuple_data().to_vec());
        }
        StmtKind::Replace => {
            rec.op = RecordOp::Replace as u8;
            rec.tuple = Some(stmt.tuple_data().to_vec());
        }
        StmtKind::Upsert => {
            rec.op = RecordOp::Upsert as u8;
            rec.tuple = Some(stmt.tuple_data().to_vec());
            rec.ops = Some(stmt.upsert_ops().to_vec());
        }
        StmtKind::Raw => unreachable!("bare keys are never encoded"),
    }
    Ok(rec)
}

/// Encode a statement for a secondary index: only the key ordered by
/// `cmp_def` is stored, whatever the kind. The opcode still follows the
/// statement's own kind (deferred-DELETE handling needs secondary
/// INSERTs to stay recognizable); only the body placement groups INSERT
/// with REPLACE. Upserts never reach secondary indexes. No persistent
/// flag survives here, `DEFERRED_DELETE` included.
pub fn encode_secondary<S: StmtRead>(
    stmt: &S,
    cmp_def: &KeyDef,
    region: &mut RegionArena,
) -> Result<WireRecord, StmtError> {
    let key = record_key(stmt, cmp_def, region)?;
    let mut rec = WireRecord {
        lsn: stmt.lsn(),
        meta: encode_meta(stmt.flags().persistent(false)),
        ..WireRecord::default()
    };
    match stmt.kind() {
        StmtKind::Delete => {
            rec.op = RecordOp::Delete as u8;
            rec.key = Some(key);
        }
        StmtKind::Insert => {
            rec.op = RecordOp::Insert as u8;
            rec.tuple = Some(key);
        }
        StmtKind::Replace => {
            rec.op = RecordOp::Replace as u8;
            rec.tuple = Some(key);
        }
        StmtKind::Upsert => unreachable!("upserts are a primary-index concern"),
        StmtKind::Raw => unreachable!("bare keys are never encoded"),
    }
    Ok(rec)
}

fn required_body(body: &Option<Vec<u8>>, op: RecordOp) -> Result<&[u8], StmtError> {
    body.as_deref().ok_or(StmtError::MalformedRecord {
        op: op.name(),
        reason: "missing body",
    })
}

/// Rebuild a heap statement from a record.
///
/// DELETE records decode into the environment's key-only format; every
/// other opcode uses `format`. Unknown metadata keys are skipped so old
/// engines keep reading records written by newer ones.
pub fn decode(env: &StmtEnv, rec: &WireRecord, format: &Arc<Format>) -> Result<HeapStmt, StmtError> {
    let op = RecordOp::from_u8(rec.op).ok_or_else(|| {
        tracing::error!(opcode = rec.op, lsn = rec.lsn.0, "unknown request type in a record");
        StmtError::CorruptRecord { opcode: rec.op }
    })?;
    let malformed = |reason: &'static str| StmtError::MalformedRecord {
        op: op.name(),
        reason,
    };

    let mut stmt = match op {
        RecordOp::Insert => {
            new_with_ops(env, format, required_body(&rec.tuple, op)?, &[], StmtKind::Insert)?
        }
        RecordOp::Replace => {
            new_with_ops(env, format, required_body(&rec.tuple, op)?, &[], StmtKind::Replace)?
        }
        RecordOp::Delete => new_with_ops(
            env,
            env.key_format(),
            required_body(&rec.key, op)?,
            &[],
            StmtKind::Delete,
        )?,
        RecordOp::Upsert => new_with_ops(
            env,
            format,
            required_body(&rec.tuple, op)?,
            &[required_body(&rec.ops, op)?],
            StmtKind::Upsert,
        )?,
    };

    if let Some(meta) = &rec.meta {
        let mut rd = MpRead::new(meta);
        let n = rd.try_read_map().ok_or(malformed("metadata is not a map"))?;
        for _ in 0..n {
            let key = rd.try_read_uint().ok_or(malformed("metadata key"))?;
            if key == META_PERSISTENT_FLAGS {
                let bits = rd.try_read_uint().ok_or(malformed("metadata flags"))?;
                stmt.set_flags(StmtFlags::from_bits_truncate(bits as u8));
            } else {
                tracing::warn!(key, "skipping unknown record metadata key");
                rd.try_skip().ok_or(malformed("metadata value"))?;
            }
        }
    }
    stmt.set_lsn(rec.lsn);
    Ok(stmt)
}
