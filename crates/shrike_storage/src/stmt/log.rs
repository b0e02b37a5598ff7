//! Append-only statement log region backing an in-memory sorted table.
//!
//! Statements copied in here are partitioned by an allocation id (one id
//! per in-memory index generation). Entries are never released
//! individually: a [`LogStmt`] handle reports a reference count of zero
//! and exposes no release operation. Memory comes back only when
//! [`StmtLog::gc`] retires whole partitions.
//!
//! Appends from different writers are serialized by the segment table
//! lock; each partition has a single logical writer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use shrike_common::error::StmtError;

use crate::stmt::layout::{StmtKind, StmtRead};

/// One log-owned statement allocation. Upsert entries carry a leading
/// squash-counter byte before the statement header.
#[derive(Debug)]
struct LogEntry {
    bytes: Box<[u8]>,
    lead: usize,
}

/// Handle to a statement living in a [`StmtLog`].
#[derive(Debug, Clone)]
pub struct LogStmt {
    entry: Arc<LogEntry>,
}

impl LogStmt {
    /// Log-owned statements are reclaimed with their segment, never
    /// individually; the count is fixed at zero by construction.
    pub fn ref_count(&self) -> u32 {
        0
    }

    /// Number of times this upsert has been squashed with older ones.
    pub fn upsert_counter(&self) -> u8 {
        debug_assert_eq!(self.entry.lead, 1, "squash counter exists on upserts only");
        self.entry.bytes[0]
    }
}

impl StmtRead for LogStmt {
    fn raw(&self) -> &[u8] {
        &self.entry.bytes[self.entry.lead..]
    }
}

/// Append-only, allocation-id-partitioned statement region.
#[derive(Debug)]
pub struct StmtLog {
    segments: RwLock<BTreeMap<i64, Vec<Arc<LogEntry>>>>,
    used: AtomicUsize,
    cap: usize,
    appended: AtomicU64,
}

impl StmtLog {
    pub fn new(cap: usize) -> StmtLog {
        StmtLog {
            segments: RwLock::new(BTreeMap::new()),
            used: AtomicUsize::new(0),
            cap,
            appended: AtomicU64::new(0),
        }
    }

    /// Bytes currently held across all partitions.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Total appends over the log's lifetime.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Copy a statement into the partition `alloc_id`. For upserts one
    /// extra leading byte is reserved for the squash counter, initialized
    /// to zero.
    pub fn dup<S: StmtRead>(&self, stmt: &S, alloc_id: i64) -> Result<LogStmt, StmtError> {
        let src = stmt.raw();
        let lead = usize::from(stmt.kind() == StmtKind::Upsert);
        let total = src.len() + lead;

        // The budget check and the reservation must not race: both happen
        // under the segment-table lock, so concurrent appends cannot
        // jointly overshoot the cap.
        let mut segments = self.segments.write();
        if self.used.load(Ordering::Relaxed) + total > self.cap {
            return Err(StmtError::OutOfMemory {
                requested: total,
                context: "statement log",
            });
        }

        let mut bytes = vec![0u8; total].into_boxed_slice();
        bytes[lead..].copy_from_slice(src);
        let entry = Arc::new(LogEntry { bytes, lead });

        segments.entry(alloc_id).or_default().push(Arc::clone(&entry));
        self.used.fetch_add(total, Ordering::Relaxed);
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(LogStmt { entry })
    }

    /// Retire every partition with `alloc_id <= max_alloc_id`.
    pub fn gc(&self, max_alloc_id: i64) {
        let mut segments = self.segments.write();
        let keep = segments.split_off(&(max_alloc_id + 1));
        let retired: usize = segments
            .values()
            .flatten()
            .map(|e| e.bytes.len())
            .sum();
        *segments = keep;
        self.used.fetch_sub(retired, Ordering::Relaxed);
        tracing::debug!(max_alloc_id, retired_bytes = retired, "statement log gc");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrike_common::types::FormatId;

    use crate::msgpack;
    use crate::stmt::layout::{self, STMT_HEADER_SIZE};

    fn heapless_stmt(kind: StmtKind) -> Vec<u8> {
        let mut payload = Vec::new();
        msgpack::write_array(&mut payload, 1);
        msgpack::write_uint(&mut payload, 9);
        if kind == StmtKind::Upsert {
            msgpack::write_array(&mut payload, 0); // empty ops block
        }
        let mut buf = vec![0u8; STMT_HEADER_SIZE + payload.len()];
        layout::init_header(&mut buf, FormatId(1), 0, payload.len() as u32, false);
        layout::set_kind(&mut buf, kind);
        buf[STMT_HEADER_SIZE..].copy_from_slice(&payload);
        buf
    }

    struct RawStmt(Vec<u8>);
    impl StmtRead for RawStmt {
        fn raw(&self) -> &[u8] {
            &self.0
        }
    }

    #[test]
    fn test_dup_copies_bytes_and_reports_zero_refs() {
        let log = StmtLog::new(1024);
        let src = RawStmt(heapless_stmt(StmtKind::Replace));
        let copy = log.dup(&src, 1).unwrap();
        assert_eq!(copy.raw(), src.raw());
        assert_eq!(copy.ref_count(), 0);
        assert_eq!(log.used(), src.raw().len());
        assert_eq!(log.appended(), 1);
    }

    #[test]
    fn test_upsert_reserves_squash_counter_byte() {
        let log = StmtLog::new(1024);
        let src = RawStmt(heapless_stmt(StmtKind::Upsert));
        let copy = log.dup(&src, 1).unwrap();
        assert_eq!(copy.raw(), src.raw());
        assert_eq!(copy.upsert_counter(), 0);
        assert_eq!(log.used(), src.raw().len() + 1);
    }

    #[test]
    fn test_gc_retires_whole_partitions() {
        let log = StmtLog::new(4096);
        let src = RawStmt(heapless_stmt(StmtKind::Replace));
        log.dup(&src, 1).unwrap();
        log.dup(&src, 2).unwrap();
        log.dup(&src, 3).unwrap();
        let per = src.raw().len();
        assert_eq!(log.used(), 3 * per);

        log.gc(2);
        assert_eq!(log.used(), per);
        log.gc(3);
        assert_eq!(log.used(), 0);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let src = RawStmt(heapless_stmt(StmtKind::Replace));
        let log = StmtLog::new(src.raw().len());
        log.dup(&src, 1).unwrap();
        let err = log.dup(&src, 1).unwrap_err();
        assert!(matches!(err, StmtError::OutOfMemory { .. }));
    }

    #[test]
    fn test_budget_is_exact_under_concurrent_appends() {
        // Room for exactly one entry: of many racing writers, exactly one
        // may win and the total must never overshoot the cap.
        let src = heapless_stmt(StmtKind::Replace);
        let cap = src.len();
        let log = std::sync::Arc::new(StmtLog::new(cap));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = std::sync::Arc::clone(&log);
                let src = src.clone();
                std::thread::spawn(move || log.dup(&RawStmt(src), i).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(log.used(), cap);
        assert_eq!(log.appended(), 1);
    }
}
