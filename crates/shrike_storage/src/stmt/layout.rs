//! Packed statement memory layout.
//!
//! Every statement, whatever its allocator, is one contiguous buffer:
//!
//! ```text
//!   [header: 24 bytes] [field_map: slots × u32] [payload: MessagePack array]
//!                                               [ops: concatenated, UPSERT only]
//! ```
//!
//! Header layout (little-endian):
//!
//! ```text
//!   [lsn: u64 @0] [format_id: u32 @8] [bsize: u32 @12] [data_offset: u32 @16]
//!   [kind: u8 @20] [flags: u8 @21] [key_shape: u8 @22] [reserved @23]
//! ```
//!
//! `bsize` is the payload size including upsert operations;
//! `data_offset` is where the payload starts (24 + field map size), so
//! `buffer length == data_offset + bsize` with no padding and no hidden
//! fields. Field-map entries are payload-relative byte offsets, `0`
//! meaning "field absent". Key-only statements have an empty field map.

use shrike_common::types::{FormatId, Lsn};

use crate::msgpack::MpRead;

/// Size of the packed statement header.
pub const STMT_HEADER_SIZE: usize = 24;

const OFF_LSN: usize = 0;
const OFF_FORMAT_ID: usize = 8;
const OFF_BSIZE: usize = 12;
const OFF_DATA_OFFSET: usize = 16;
const OFF_KIND: usize = 20;
const OFF_FLAGS: usize = 21;
const OFF_KEY_SHAPE: usize = 22;

/// Operation kind of a statement. `Raw` (0) is an untyped bare key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StmtKind {
    Raw = 0,
    Insert = 1,
    Replace = 2,
    Delete = 3,
    Upsert = 4,
}

impl StmtKind {
    pub fn from_u8(b: u8) -> Option<StmtKind> {
        match b {
            0 => Some(StmtKind::Raw),
            1 => Some(StmtKind::Insert),
            2 => Some(StmtKind::Replace),
            3 => Some(StmtKind::Delete),
            4 => Some(StmtKind::Upsert),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StmtKind::Raw => "RAW",
            StmtKind::Insert => "INSERT",
            StmtKind::Replace => "REPLACE",
            StmtKind::Delete => "DELETE",
            StmtKind::Upsert => "UPSERT",
        }
    }
}

bitflags::bitflags! {
    /// Statement flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StmtFlags: u8 {
        /// The DELETE for this statement was deferred to primary-index
        /// compaction. Meaningful for primary-index records only.
        const DEFERRED_DELETE = 0x01;
        /// Write-iterator hint that a REPLACE came from an update and may
        /// be turned into an INSERT on dump. Transient: never persisted.
        const UPDATE_HINT = 0x02;
    }
}

impl StmtFlags {
    /// The flags that survive encoding to disk or the wire.
    ///
    /// `UPDATE_HINT` is an in-memory signal and is always dropped.
    /// `DEFERRED_DELETE` may only be produced by primary-index
    /// compaction, so secondary-index records drop it too.
    pub fn persistent(self, is_primary: bool) -> StmtFlags {
        let mut mask = StmtFlags::all();
        mask.remove(StmtFlags::UPDATE_HINT);
        if !is_primary {
            mask.remove(StmtFlags::DEFERRED_DELETE);
        }
        self & mask
    }
}

/// Read access to a statement, independent of its allocator.
///
/// `raw()` returns the whole allocation starting at the header; every
/// other accessor is derived from it.
pub trait StmtRead {
    /// The complete statement buffer: header + field map + payload.
    fn raw(&self) -> &[u8];

    fn lsn(&self) -> Lsn {
        let raw = self.raw();
        Lsn(u64::from_le_bytes(raw[OFF_LSN..OFF_LSN + 8].try_into().unwrap()))
    }

    fn format_id(&self) -> FormatId {
        let raw = self.raw();
        FormatId(u32::from_le_bytes(
            raw[OFF_FORMAT_ID..OFF_FORMAT_ID + 4].try_into().unwrap(),
        ))
    }

    /// Payload size in bytes (MessagePack data plus, for upserts, the
    /// operations block).
    fn bsize(&self) -> u32 {
        let raw = self.raw();
        u32::from_le_bytes(raw[OFF_BSIZE..OFF_BSIZE + 4].try_into().unwrap())
    }

    /// Offset of the payload within the buffer.
    fn data_offset(&self) -> usize {
        let raw = self.raw();
        u32::from_le_bytes(raw[OFF_DATA_OFFSET..OFF_DATA_OFFSET + 4].try_into().unwrap()) as usize
    }

    fn kind(&self) -> StmtKind {
        StmtKind::from_u8(self.raw()[OFF_KIND]).expect("corrupt statement kind byte")
    }

    fn flags(&self) -> StmtFlags {
        StmtFlags::from_bits_truncate(self.raw()[OFF_FLAGS])
    }

    /// True when the payload is a bare key array rather than a full row
    /// (the statement was built against a key-only format).
    fn is_key(&self) -> bool {
        self.raw()[OFF_KEY_SHAPE] != 0
    }

    /// Total statement size: header + field map + payload. Always equals
    /// the buffer length.
    fn total_size(&self) -> usize {
        self.raw().len()
    }

    /// The raw field-map region.
    fn field_map(&self) -> &[u8] {
        let raw = self.raw();
        &raw[STMT_HEADER_SIZE..self.data_offset()]
    }

    /// Payload-relative offset recorded for a slot, or `None` when the
    /// field is absent from this statement.
    fn field_map_slot(&self, slot: u32) -> Option<u32> {
        let map = self.field_map();
        let at = slot as usize * 4;
        let off = u32::from_le_bytes(map[at..at + 4].try_into().unwrap());
        if off == 0 {
            None
        } else {
            Some(off)
        }
    }

    /// The whole payload, including the operations block for upserts.
    fn payload(&self) -> &[u8] {
        let raw = self.raw();
        let start = self.data_offset();
        &raw[start..start + self.bsize() as usize]
    }

    /// The row tuple alone. For upserts this stops at the end of the
    /// MessagePack field array; for every other kind it is the payload.
    fn tuple_data(&self) -> &[u8] {
        let payload = self.payload();
        if self.kind() != StmtKind::Upsert {
            return payload;
        }
        let mut rd = MpRead::new(payload);
        rd.skip();
        &payload[..rd.pos()]
    }

    /// The concatenated update operations of an upsert.
    fn upsert_ops(&self) -> &[u8] {
        debug_assert_eq!(self.kind(), StmtKind::Upsert);
        let payload = self.payload();
        let mut rd = MpRead::new(payload);
        rd.skip();
        &payload[rd.pos()..]
    }
}

// ── header writing (crate-internal, used by the allocators) ─────────────────

/// Initialize a freshly allocated statement buffer: kind `Raw`, lsn 0,
/// no flags.
pub(crate) fn init_header(
    buf: &mut [u8],
    format_id: FormatId,
    field_map_size: u32,
    bsize: u32,
    key_shape: bool,
) {
    debug_assert_eq!(
        buf.len(),
        STMT_HEADER_SIZE + field_map_size as usize + bsize as usize
    );
    buf[OFF_LSN..OFF_LSN + 8].copy_from_slice(&0u64.to_le_bytes());
    buf[OFF_FORMAT_ID..OFF_FORMAT_ID + 4].copy_from_slice(&format_id.0.to_le_bytes());
    buf[OFF_BSIZE..OFF_BSIZE + 4].copy_from_slice(&bsize.to_le_bytes());
    let data_offset = STMT_HEADER_SIZE as u32 + field_map_size;
    buf[OFF_DATA_OFFSET..OFF_DATA_OFFSET + 4].copy_from_slice(&data_offset.to_le_bytes());
    buf[OFF_KIND] = StmtKind::Raw as u8;
    buf[OFF_FLAGS] = 0;
    buf[OFF_KEY_SHAPE] = u8::from(key_shape);
    buf[OFF_KEY_SHAPE + 1] = 0;
}

pub(crate) fn set_kind(buf: &mut [u8], kind: StmtKind) {
    buf[OFF_KIND] = kind as u8;
}

pub(crate) fn set_lsn(buf: &mut [u8], lsn: Lsn) {
    buf[OFF_LSN..OFF_LSN + 8].copy_from_slice(&lsn.0.to_le_bytes());
}

pub(crate) fn set_flags(buf: &mut [u8], flags: StmtFlags) {
    buf[OFF_FLAGS] = flags.bits();
}

/// Write one field-map slot. Offsets are payload-relative; `0` marks an
/// absent field, which is unambiguous because offset 0 always holds the
/// payload's array header, never a field.
pub(crate) fn set_field_map_slot(field_map: &mut [u8], slot: u32, offset: u32) {
    let at = slot as usize * 4;
    field_map[at..at + 4].copy_from_slice(&offset.to_le_bytes());
}
