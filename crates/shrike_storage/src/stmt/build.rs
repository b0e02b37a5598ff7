//! Statement environment and construction API.
//!
//! All statements are born here (or in the derivation paths that call
//! back in): the validating constructors for each operation kind, the
//! bare-key constructor, duplication into the heap and into the
//! statement log, and the non-validating path used by wire decode where
//! the bytes are already known-valid.
//!
//! Heap statements are atomically reference-counted and may be read from
//! any thread; the format pin bookkeeping, however, only happens on the
//! coordinating thread, so worker-thread allocations never touch the
//! shared schema counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shrike_common::error::StmtError;
use shrike_common::types::Lsn;

use crate::format::Format;
use crate::msgpack::{self, MpRead, MpType};
use crate::stmt::layout::{self, StmtFlags, StmtKind, StmtRead, STMT_HEADER_SIZE};
use crate::stmt::log::{LogStmt, StmtLog};

/// Configuration for the statement environment.
#[derive(Debug, Clone)]
pub struct StmtEnvConfig {
    /// Hard cap on a single statement allocation (header + field map +
    /// payload). Requests above it are rejected before allocating.
    pub max_stmt_size: usize,
}

impl Default for StmtEnvConfig {
    fn default() -> Self {
        Self {
            max_stmt_size: 1024 * 1024,
        }
    }
}

/// Shared environment for statement construction.
///
/// Owns the key-only format that DELETE records decode into and the
/// allocation statistics the oversize tests rely on.
#[derive(Debug)]
pub struct StmtEnv {
    config: StmtEnvConfig,
    key_format: Arc<Format>,
    heap_allocs: AtomicU64,
    heap_bytes: AtomicU64,
}

impl StmtEnv {
    pub fn new(config: StmtEnvConfig) -> StmtEnv {
        StmtEnv {
            config,
            key_format: Arc::new(Format::key_format(Default::default())),
            heap_allocs: AtomicU64::new(0),
            heap_bytes: AtomicU64::new(0),
        }
    }

    /// The key-only format used for bare keys and decoded DELETEs.
    pub fn key_format(&self) -> &Arc<Format> {
        &self.key_format
    }

    /// Number of heap statement allocations performed so far.
    pub fn heap_alloc_count(&self) -> u64 {
        self.heap_allocs.load(Ordering::Relaxed)
    }

    /// Bytes handed out by the heap backend so far.
    pub fn heap_alloc_bytes(&self) -> u64 {
        self.heap_bytes.load(Ordering::Relaxed)
    }

    /// Heap backend: allocate a statement buffer with the header
    /// initialized and field map + payload zeroed.
    ///
    /// The oversize check happens before any allocation; a rejected
    /// request leaves no trace beyond the warning.
    pub(crate) fn alloc_buf(&self, format: &Format, bsize: u32) -> Result<Vec<u8>, StmtError> {
        let total = STMT_HEADER_SIZE + format.field_map_size() as usize + bsize as usize;
        if total > self.config.max_stmt_size {
            tracing::warn!(
                format_id = format.id().0,
                size = total,
                max = self.config.max_stmt_size,
                "statement exceeds the size limit"
            );
            return Err(StmtError::OversizeStatement {
                size: total,
                max: self.config.max_stmt_size,
            });
        }
        self.heap_allocs.fetch_add(1, Ordering::Relaxed);
        self.heap_bytes.fetch_add(total as u64, Ordering::Relaxed);
        let mut buf = vec![0u8; total];
        layout::init_header(
            &mut buf,
            format.id(),
            format.field_map_size(),
            bsize,
            format.is_key_format(),
        );
        tracing::debug!(
            format_id = format.id().0,
            field_map = format.field_map_size(),
            bsize,
            "statement alloc"
        );
        Ok(buf)
    }
}

/// Heap-owned statement: one buffer behind an atomic reference count
/// that starts at 1. Cloning shares the buffer; the last handle dropped
/// on the coordinating thread releases the format pin taken at
/// allocation time.
#[derive(Debug)]
pub struct HeapStmt {
    buf: Arc<[u8]>,
    format: Arc<Format>,
    pinned: bool,
}

impl HeapStmt {
    pub(crate) fn from_buf(format: &Arc<Format>, buf: Vec<u8>) -> HeapStmt {
        let pinned = format.on_coord_thread();
        if pinned {
            format.pin_stmt();
        }
        HeapStmt {
            buf: buf.into(),
            format: Arc::clone(format),
            pinned,
        }
    }

    /// Current reference count (1 = unshared).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buf)
    }

    pub fn format(&self) -> &Arc<Format> {
        &self.format
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        Arc::get_mut(&mut self.buf).expect("cannot mutate a statement that is already shared")
    }

    /// Assign the version. Write-once before publication: the statement
    /// must not have been shared yet.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        layout::set_lsn(self.buf_mut(), lsn);
    }

    /// Set the flag bits. Same publication rule as [`HeapStmt::set_lsn`].
    pub fn set_flags(&mut self, flags: StmtFlags) {
        layout::set_flags(self.buf_mut(), flags);
    }
}

impl Clone for HeapStmt {
    fn clone(&self) -> Self {
        HeapStmt {
            buf: Arc::clone(&self.buf),
            format: Arc::clone(&self.format),
            pinned: self.pinned,
        }
    }
}

impl Drop for HeapStmt {
    fn drop(&mut self) {
        // Format pins are coordinator-thread-only: a pinned statement
        // whose last handle dies on a worker keeps its pin, exactly like
        // the refcount it models.
        if self.pinned && Arc::strong_count(&self.buf) == 1 && self.format.on_coord_thread() {
            self.format.unpin_stmt();
        }
    }
}

impl StmtRead for HeapStmt {
    fn raw(&self) -> &[u8] {
        &self.buf
    }
}

// ── construction API ─────────────────────────────────────────────────────────

/// Build a statement from known-valid tuple bytes, skipping validation.
///
/// Wire decode comes through here: the bytes were validated when the
/// record was first written. A statement loaded from an old run may even
/// predate the current schema, which is why the field map build tolerates
/// missing fields.
pub fn new_with_ops(
    env: &StmtEnv,
    format: &Arc<Format>,
    tuple: &[u8],
    ops: &[&[u8]],
    kind: StmtKind,
) -> Result<HeapStmt, StmtError> {
    debug_assert!(MpRead::new(tuple).try_peek_type() == Some(MpType::Array));
    let field_map = format.build_field_map(tuple);
    let ops_size: usize = ops.iter().map(|op| op.len()).sum();
    let bsize = (tuple.len() + ops_size) as u32;

    let mut buf = env.alloc_buf(format, bsize)?;
    let fm_end = STMT_HEADER_SIZE + format.field_map_size() as usize;
    for (slot, off) in field_map.iter().enumerate() {
        layout::set_field_map_slot(&mut buf[STMT_HEADER_SIZE..fm_end], slot as u32, *off);
    }
    let mut pos = fm_end;
    buf[pos..pos + tuple.len()].copy_from_slice(tuple);
    pos += tuple.len();
    for op in ops {
        buf[pos..pos + op.len()].copy_from_slice(op);
        pos += op.len();
    }
    debug_assert_eq!(pos, buf.len());
    layout::set_kind(&mut buf, kind);
    Ok(HeapStmt::from_buf(format, buf))
}

pub fn new_insert(env: &StmtEnv, format: &Arc<Format>, tuple: &[u8]) -> Result<HeapStmt, StmtError> {
    format.validate(tuple)?;
    new_with_ops(env, format, tuple, &[], StmtKind::Insert)
}

pub fn new_replace(env: &StmtEnv, format: &Arc<Format>, tuple: &[u8]) -> Result<HeapStmt, StmtError> {
    format.validate(tuple)?;
    new_with_ops(env, format, tuple, &[], StmtKind::Replace)
}

pub fn new_delete(env: &StmtEnv, format: &Arc<Format>, tuple: &[u8]) -> Result<HeapStmt, StmtError> {
    format.validate(tuple)?;
    new_with_ops(env, format, tuple, &[], StmtKind::Delete)
}

/// Build an UPSERT: the row tuple followed by the concatenated update
/// operation blocks.
pub fn new_upsert(
    env: &StmtEnv,
    format: &Arc<Format>,
    tuple: &[u8],
    ops: &[&[u8]],
) -> Result<HeapStmt, StmtError> {
    format.validate(tuple)?;
    new_with_ops(env, format, tuple, ops, StmtKind::Upsert)
}

/// Build a bare-key statement from concatenated key part values.
///
/// The format must be key-only (no field map). The resulting statement
/// is untyped (`Raw`); decode paths that need a typed DELETE go through
/// [`new_with_ops`] with the key format instead.
pub fn new_key(
    env: &StmtEnv,
    format: &Arc<Format>,
    key_parts: &[u8],
    part_count: u32,
) -> Result<HeapStmt, StmtError> {
    assert!(format.is_key_format(), "bare keys require a key-only format");
    debug_assert_eq!(format.field_map_size(), 0);
    debug_assert!({
        let mut rd = MpRead::new(key_parts);
        for _ in 0..part_count {
            rd.skip();
        }
        rd.is_empty()
    });

    let bsize = (msgpack::sizeof_array(part_count) + key_parts.len()) as u32;
    let mut buf = env.alloc_buf(format, bsize)?;
    let mut header = Vec::with_capacity(msgpack::sizeof_array(part_count));
    msgpack::write_array(&mut header, part_count);
    let mut pos = STMT_HEADER_SIZE;
    buf[pos..pos + header.len()].copy_from_slice(&header);
    pos += header.len();
    buf[pos..pos + key_parts.len()].copy_from_slice(key_parts);
    Ok(HeapStmt::from_buf(format, buf))
}

/// Byte-copy of a bare MessagePack key array.
pub fn key_dup(key: &[u8]) -> Vec<u8> {
    let mut rd = MpRead::new(key);
    assert_eq!(rd.peek_type(), MpType::Array, "a key is a MessagePack array");
    rd.skip();
    key[..rd.pos()].to_vec()
}

/// Heap-duplicate a statement: byte-identical header, field map and
/// payload, independent reference count starting at 1, no memory shared
/// with the source.
pub fn dup<S: StmtRead>(
    env: &StmtEnv,
    format: &Arc<Format>,
    stmt: &S,
) -> Result<HeapStmt, StmtError> {
    debug_assert_eq!(format.id(), stmt.format_id());
    let mut buf = env.alloc_buf(format, stmt.bsize())?;
    debug_assert_eq!(buf.len(), stmt.total_size());
    buf.copy_from_slice(stmt.raw());
    Ok(HeapStmt::from_buf(format, buf))
}

/// Duplicate a statement into the statement log's `alloc_id` partition.
pub fn dup_into_log<S: StmtRead>(log: &StmtLog, stmt: &S, alloc_id: i64) -> Result<LogStmt, StmtError> {
    log.dup(stmt, alloc_id)
}

/// Derive a REPLACE carrying an upsert's row tuple: same field map, same
/// lsn, operations block dropped.
pub fn replace_from_upsert<S: StmtRead>(
    env: &StmtEnv,
    format: &Arc<Format>,
    upsert: &S,
) -> Result<HeapStmt, StmtError> {
    assert_eq!(upsert.kind(), StmtKind::Upsert);
    let tuple = upsert.tuple_data();
    let mut buf = env.alloc_buf(format, tuple.len() as u32)?;
    let fm_end = STMT_HEADER_SIZE + format.field_map_size() as usize;
    buf[STMT_HEADER_SIZE..fm_end].copy_from_slice(upsert.field_map());
    buf[fm_end..].copy_from_slice(tuple);
    layout::set_kind(&mut buf, StmtKind::Replace);
    layout::set_lsn(&mut buf, upsert.lsn());
    Ok(HeapStmt::from_buf(format, buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrike_common::types::FormatId;

    use crate::format::{KeyDef, KeyPart};

    fn env() -> StmtEnv {
        StmtEnv::new(StmtEnvConfig::default())
    }

    fn tuple_format() -> Arc<Format> {
        let pk = KeyDef::new(vec![KeyPart::field(0)]);
        Arc::new(Format::new(FormatId(1), &[&pk]))
    }

    fn row(id: u64, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        msgpack::write_array(&mut out, 2);
        msgpack::write_uint(&mut out, id);
        msgpack::write_str(&mut out, value);
        out
    }

    #[test]
    fn test_insert_size_invariant() {
        let env = env();
        let format = tuple_format();
        let tuple = row(1, "a");
        let stmt = new_insert(&env, &format, &tuple).unwrap();
        assert_eq!(stmt.kind(), StmtKind::Insert);
        assert_eq!(stmt.lsn(), Lsn::UNASSIGNED);
        assert_eq!(
            stmt.total_size(),
            STMT_HEADER_SIZE + format.field_map_size() as usize + tuple.len()
        );
        assert_eq!(stmt.payload(), &tuple[..]);
        assert!(!stmt.is_key());
    }

    #[test]
    fn test_upsert_bsize_covers_ops() {
        let env = env();
        let format = tuple_format();
        let tuple = row(1, "a");
        let mut op1 = Vec::new();
        msgpack::write_array(&mut op1, 1);
        msgpack::write_str(&mut op1, "+");
        let mut op2 = Vec::new();
        msgpack::write_array(&mut op2, 1);
        msgpack::write_str(&mut op2, "=");

        let stmt = new_upsert(&env, &format, &tuple, &[&op1, &op2]).unwrap();
        assert_eq!(stmt.kind(), StmtKind::Upsert);
        assert_eq!(stmt.bsize() as usize, tuple.len() + op1.len() + op2.len());
        assert_eq!(stmt.tuple_data(), &tuple[..]);
        let mut ops = op1.clone();
        ops.extend_from_slice(&op2);
        assert_eq!(stmt.upsert_ops(), &ops[..]);
    }

    #[test]
    fn test_validating_constructor_rejects_bad_tuple() {
        let env = env();
        let format = tuple_format();
        let err = new_insert(&env, &format, &[0xc0]).unwrap_err();
        assert!(matches!(err, StmtError::ValidationFailure { .. }));
        assert_eq!(env.heap_alloc_count(), 0);
    }

    #[test]
    fn test_oversize_rejected_before_allocation() {
        let env = StmtEnv::new(StmtEnvConfig { max_stmt_size: 64 });
        let format = tuple_format();
        let tuple = row(1, &"x".repeat(128));
        let err = new_replace(&env, &format, &tuple).unwrap_err();
        assert!(matches!(err, StmtError::OversizeStatement { .. }));
        assert_eq!(env.heap_alloc_count(), 0);
        assert_eq!(env.heap_alloc_bytes(), 0);
    }

    #[test]
    fn test_field_map_points_at_primary_key() {
        let env = env();
        let format = tuple_format();
        let stmt = new_insert(&env, &format, &row(77, "v")).unwrap();
        let off = stmt.field_map_slot(0).unwrap();
        let mut rd = MpRead::new(&stmt.payload()[off as usize..]);
        assert_eq!(rd.read_uint(), 77);
    }

    #[test]
    fn test_new_key_is_untyped_and_key_shaped() {
        let env = env();
        let mut parts = Vec::new();
        msgpack::write_uint(&mut parts, 5);
        msgpack::write_str(&mut parts, "k");
        let stmt = new_key(&env, env.key_format(), &parts, 2).unwrap();
        assert_eq!(stmt.kind(), StmtKind::Raw);
        assert!(stmt.is_key());
        let mut rd = MpRead::new(stmt.payload());
        assert_eq!(rd.read_array(), 2);
        assert_eq!(rd.read_uint(), 5);
        assert_eq!(rd.read_str(), &b"k"[..]);
    }

    #[test]
    fn test_dup_is_independent() {
        let env = env();
        let format = tuple_format();
        let mut stmt = new_replace(&env, &format, &row(3, "v")).unwrap();
        stmt.set_lsn(Lsn(42));
        stmt.set_flags(StmtFlags::UPDATE_HINT);

        let shared = stmt.clone();
        assert_eq!(stmt.ref_count(), 2);

        let copy = dup(&env, &format, &stmt).unwrap();
        assert_eq!(copy.ref_count(), 1);
        assert_eq!(stmt.ref_count(), 2); // dup left the source alone
        assert_eq!(copy.raw(), stmt.raw());
        assert_eq!(copy.lsn(), Lsn(42));
        assert_eq!(copy.flags(), StmtFlags::UPDATE_HINT);
        drop(shared);
        assert_eq!(stmt.ref_count(), 1);
    }

    #[test]
    #[should_panic(expected = "already shared")]
    fn test_mutating_shared_statement_panics() {
        let env = env();
        let format = tuple_format();
        let mut stmt = new_insert(&env, &format, &row(1, "a")).unwrap();
        let _other = stmt.clone();
        stmt.set_lsn(Lsn(1));
    }

    #[test]
    fn test_format_pins_follow_coordinator_allocations() {
        let env = env();
        let format = tuple_format();
        assert_eq!(format.stmt_pin_count(), 0);
        let a = new_insert(&env, &format, &row(1, "a")).unwrap();
        let b = dup(&env, &format, &a).unwrap();
        assert_eq!(format.stmt_pin_count(), 2);
        let a2 = a.clone(); // refs, not allocations
        assert_eq!(format.stmt_pin_count(), 2);
        drop(a);
        drop(a2);
        drop(b);
        assert_eq!(format.stmt_pin_count(), 0);
    }

    #[test]
    fn test_worker_thread_allocations_skip_pins() {
        let env = Arc::new(env());
        let format = tuple_format();
        let tuple = row(9, "w");
        let worker_format = Arc::clone(&format);
        let worker_env = Arc::clone(&env);
        let stmt = std::thread::spawn(move || {
            new_insert(&worker_env, &worker_format, &tuple).unwrap()
        })
        .join()
        .unwrap();
        assert_eq!(format.stmt_pin_count(), 0);
        drop(stmt); // dropped here on the coordinator: still no pin to release
        assert_eq!(format.stmt_pin_count(), 0);
    }

    #[test]
    fn test_replace_from_upsert_drops_ops_keeps_lsn() {
        let env = env();
        let format = tuple_format();
        let tuple = row(4, "u");
        let mut op = Vec::new();
        msgpack::write_array(&mut op, 1);
        msgpack::write_str(&mut op, "!");
        let mut upsert = new_upsert(&env, &format, &tuple, &[&op]).unwrap();
        upsert.set_lsn(Lsn(7));

        let replace = replace_from_upsert(&env, &format, &upsert).unwrap();
        assert_eq!(replace.kind(), StmtKind::Replace);
        assert_eq!(replace.lsn(), Lsn(7));
        assert_eq!(replace.payload(), &tuple[..]);
        assert_eq!(replace.field_map(), upsert.field_map());
    }

    #[test]
    fn test_key_dup_copies_exactly_one_array() {
        let mut key = Vec::new();
        msgpack::write_array(&mut key, 1);
        msgpack::write_uint(&mut key, 3);
        let mut padded = key.clone();
        padded.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(key_dup(&padded), key);
    }
}
