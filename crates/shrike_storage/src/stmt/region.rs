//! Caller-scoped bump arena for transient statement memory.
//!
//! One arena per worker thread, never shared. Allocation hands out
//! sequential byte ranges; nothing is freed individually. Callers record
//! the watermark with [`RegionArena::used`] before a burst of scratch
//! allocations and restore it with [`RegionArena::truncate`] on every
//! exit path once the scratch is no longer referenced (the borrow checker
//! enforces the "no longer referenced" half).

use shrike_common::error::StmtError;
use shrike_common::types::FormatId;

use crate::format::Format;
use crate::stmt::layout::{self, StmtRead, STMT_HEADER_SIZE};

/// Bump allocator with a fixed byte budget.
#[derive(Debug)]
pub struct RegionArena {
    buf: Vec<u8>,
    cap: usize,
}

impl RegionArena {
    pub fn with_capacity(cap: usize) -> RegionArena {
        RegionArena {
            buf: Vec::with_capacity(cap.min(64 * 1024)),
            cap,
        }
    }

    /// Current watermark: bytes handed out so far.
    pub fn used(&self) -> usize {
        self.buf.len()
    }

    /// Allocate a zero-filled range. Fails with `OutOfMemory` when the
    /// budget is exhausted; no partial allocation is performed.
    pub fn alloc(&mut self, len: usize, context: &'static str) -> Result<&mut [u8], StmtError> {
        let start = self.buf.len();
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.cap)
            .ok_or(StmtError::OutOfMemory {
                requested: len,
                context,
            })?;
        self.buf.resize(end, 0);
        Ok(&mut self.buf[start..end])
    }

    /// Roll back to a previously recorded watermark, reclaiming every
    /// allocation made since then at once.
    pub fn truncate(&mut self, watermark: usize) {
        assert!(watermark <= self.buf.len(), "watermark is ahead of the arena");
        self.buf.truncate(watermark);
    }
}

/// Allocate an arena-owned statement buffer: header initialized, field
/// map zeroed, payload left for the caller to fill. Wrap the filled
/// buffer in [`ArenaStmt`] to read it.
pub fn alloc_stmt<'r>(
    region: &'r mut RegionArena,
    format: &Format,
    bsize: u32,
) -> Result<&'r mut [u8], StmtError> {
    let total = STMT_HEADER_SIZE + format.field_map_size() as usize + bsize as usize;
    let buf = region.alloc(total, "arena statement")?;
    layout::init_header(buf, format.id(), format.field_map_size(), bsize, format.is_key_format());
    Ok(buf)
}

/// A statement living inside a [`RegionArena`]. Borrowed, single-thread,
/// reclaimed wholesale by the arena watermark; there is no release
/// operation.
#[derive(Debug, Clone, Copy)]
pub struct ArenaStmt<'a> {
    buf: &'a [u8],
}

impl<'a> ArenaStmt<'a> {
    pub fn new(buf: &'a [u8]) -> ArenaStmt<'a> {
        debug_assert!(buf.len() >= STMT_HEADER_SIZE);
        ArenaStmt { buf }
    }
}

impl StmtRead for ArenaStmt<'_> {
    fn raw(&self) -> &[u8] {
        self.buf
    }
}
