//! Schema formats and key definitions.
//!
//! A [`Format`] describes the shape of a row: which fields (addressed by
//! top-level position plus an optional nested path) participate in any
//! index, how many field-map offset slots the statement header region
//! reserves, and how deep indexed nesting may go. Statements store only
//! the format id; the descriptor itself is shared as `Arc<Format>`.
//!
//! The per-format statement pin counter is deliberately not thread-safe
//! in its usage contract: it is mutated only on the coordinating thread
//! (the thread that created the format), mirroring how worker threads
//! read formats without touching their reference count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use shrike_common::error::StmtError;
use shrike_common::types::FormatId;

use crate::msgpack::{self, MpRead, MpType};
use crate::stmt::region::RegionArena;

/// One step of a field path: array position or map string key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldToken {
    Num(u32),
    Str(Vec<u8>),
}

impl FieldToken {
    pub fn str(s: &str) -> FieldToken {
        FieldToken::Str(s.as_bytes().to_vec())
    }
}

/// A node of the field-definition tree.
#[derive(Debug)]
pub struct FieldNode {
    token: FieldToken,
    is_key_part: bool,
    offset_slot: Option<u32>,
    children: Vec<FieldNode>,
}

impl FieldNode {
    fn new(token: FieldToken) -> Self {
        FieldNode {
            token,
            is_key_part: false,
            offset_slot: None,
            children: Vec::new(),
        }
    }

    pub fn is_key_part(&self) -> bool {
        self.is_key_part
    }

    pub fn offset_slot(&self) -> Option<u32> {
        self.offset_slot
    }

    /// True when some key part addresses a value nested inside this field.
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Child addressed by array position.
    pub fn child_by_num(&self, num: u32) -> Option<&FieldNode> {
        self.children
            .iter()
            .find(|c| matches!(c.token, FieldToken::Num(n) if n == num))
    }

    /// Child addressed by map key.
    pub fn child_by_str(&self, key: &[u8]) -> Option<&FieldNode> {
        self.children
            .iter()
            .find(|c| matches!(&c.token, FieldToken::Str(s) if s.as_slice() == key))
    }

    fn child_mut(&mut self, token: &FieldToken) -> &mut FieldNode {
        let idx = self.children.iter().position(|c| &c.token == token);
        match idx {
            Some(i) => &mut self.children[i],
            None => {
                self.children.push(FieldNode::new(token.clone()));
                self.children.last_mut().unwrap()
            }
        }
    }
}

/// One part of an index key: a top-level field plus an optional nested
/// path inside it.
#[derive(Debug, Clone)]
pub struct KeyPart {
    pub field_no: u32,
    pub path: Vec<FieldToken>,
}

impl KeyPart {
    /// Part addressing a whole top-level field.
    pub fn field(field_no: u32) -> KeyPart {
        KeyPart {
            field_no,
            path: Vec::new(),
        }
    }

    /// Part addressing a value nested inside a top-level field.
    pub fn path(field_no: u32, path: Vec<FieldToken>) -> KeyPart {
        KeyPart { field_no, path }
    }
}

/// Which fields form an index's key, in comparison order.
#[derive(Debug, Clone)]
pub struct KeyDef {
    parts: Vec<KeyPart>,
}

impl KeyDef {
    pub fn new(parts: Vec<KeyPart>) -> KeyDef {
        assert!(!parts.is_empty(), "key definition needs at least one part");
        KeyDef { parts }
    }

    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Locate each key part inside a row tuple, in definition order.
    ///
    /// A part missing from the tuple yields `None` (encoded as nil by the
    /// callers that materialize keys).
    pub fn part_ranges(&self, tuple: &[u8]) -> Vec<Option<(usize, usize)>> {
        self.parts
            .iter()
            .map(|p| locate_field(tuple, p.field_no, &p.path))
            .collect()
    }

    /// Extract the key as a bare MessagePack array `[part, part, ...]`
    /// materialized in the caller's scratch arena.
    ///
    /// The caller owns watermark save/restore around this call.
    pub fn extract_raw<'r>(
        &self,
        tuple: &[u8],
        region: &'r mut RegionArena,
    ) -> Result<&'r [u8], StmtError> {
        let ranges = self.part_ranges(tuple);
        let mut size = msgpack::sizeof_array(self.part_count());
        for r in &ranges {
            size += match r {
                Some((start, end)) => end - start,
                None => 1, // nil
            };
        }
        let buf = region.alloc(size, "extracted key")?;
        let mut wr = msgpack::MpWrite::new(buf);
        wr.array(self.parts.len() as u32);
        for r in &ranges {
            match r {
                Some((start, end)) => wr.raw(&tuple[*start..*end]),
                None => wr.nil(),
            }
        }
        debug_assert_eq!(wr.pos(), size);
        Ok(&buf[..size])
    }
}

/// Byte range of the value addressed by `field_no` + `path` within a row
/// tuple, or `None` if the tuple does not reach it.
///
/// Panics on malformed MessagePack (caller contract: tuples are
/// validated before they get here).
pub fn locate_field(tuple: &[u8], field_no: u32, path: &[FieldToken]) -> Option<(usize, usize)> {
    let mut rd = MpRead::new(tuple);
    let count = rd.read_array();
    if field_no >= count {
        return None;
    }
    for _ in 0..field_no {
        rd.skip();
    }
    for token in path {
        match token {
            FieldToken::Num(idx) => {
                if rd.peek_type() != MpType::Array {
                    return None;
                }
                let n = rd.read_array();
                if *idx >= n {
                    return None;
                }
                for _ in 0..*idx {
                    rd.skip();
                }
            }
            FieldToken::Str(key) => {
                if rd.peek_type() != MpType::Map {
                    return None;
                }
                let n = rd.read_map();
                let mut found = false;
                for _ in 0..n {
                    if rd.peek_type() == MpType::Str {
                        let k = rd.read_str();
                        if k == key.as_slice() {
                            found = true;
                            break;
                        }
                    } else {
                        rd.skip();
                    }
                    rd.skip(); // value of a non-matching pair
                }
                if !found {
                    return None;
                }
            }
        }
    }
    let start = rd.pos();
    rd.skip();
    Some((start, rd.pos()))
}

/// Schema descriptor for one index's statements.
#[derive(Debug)]
pub struct Format {
    id: FormatId,
    root: FieldNode,
    slots: u32,
    index_field_count: u32,
    depth: u32,
    exact_field_count: Option<u32>,
    is_key: bool,
    coord: ThreadId,
    stmt_pins: AtomicU64,
}

impl Format {
    /// Build a tuple format from the key definitions of all indexes of a
    /// space. Offset slots are assigned to key-part leaves in definition
    /// order; every node along a part's path is marked as a key part.
    pub fn new(id: FormatId, key_defs: &[&KeyDef]) -> Format {
        let mut root = FieldNode::new(FieldToken::Num(0));
        let mut slots = 0u32;
        let mut index_field_count = 0u32;
        let mut depth = 1u32;
        for def in key_defs {
            for part in def.parts() {
                index_field_count = index_field_count.max(part.field_no + 1);
                depth = depth.max(1 + part.path.len() as u32);
                let mut node = root.child_mut(&FieldToken::Num(part.field_no));
                node.is_key_part = true;
                for token in &part.path {
                    node = node.child_mut(token);
                    node.is_key_part = true;
                }
                if node.offset_slot.is_none() {
                    node.offset_slot = Some(slots);
                    slots += 1;
                }
            }
        }
        Format {
            id,
            root,
            slots,
            index_field_count,
            depth,
            exact_field_count: None,
            is_key: false,
            coord: thread::current().id(),
            stmt_pins: AtomicU64::new(0),
        }
    }

    /// Build a key-only format: no field map, no indexed tree. Bare-key
    /// statements (and decoded DELETE records) use this.
    pub fn key_format(id: FormatId) -> Format {
        Format {
            id,
            root: FieldNode::new(FieldToken::Num(0)),
            slots: 0,
            index_field_count: 0,
            depth: 1,
            exact_field_count: None,
            is_key: true,
            coord: thread::current().id(),
            stmt_pins: AtomicU64::new(0),
        }
    }

    /// Require rows to have exactly this many top-level fields.
    pub fn with_exact_field_count(mut self, count: u32) -> Format {
        self.exact_field_count = Some(count);
        self
    }

    pub fn id(&self) -> FormatId {
        self.id
    }

    pub fn is_key_format(&self) -> bool {
        self.is_key
    }

    pub fn root(&self) -> &FieldNode {
        &self.root
    }

    /// Number of field-map offset slots.
    pub fn slot_count(&self) -> u32 {
        self.slots
    }

    /// Byte size of the field map region in a statement allocation.
    pub fn field_map_size(&self) -> u32 {
        self.slots * 4
    }

    /// Number of leading top-level fields referenced by any index.
    pub fn index_field_count(&self) -> u32 {
        self.index_field_count
    }

    /// Maximum nesting depth of the indexed field tree; bounds the frame
    /// stack of the surrogate walk.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Validate raw tuple bytes against this format.
    pub fn validate(&self, tuple: &[u8]) -> Result<(), StmtError> {
        let fail = |reason: &str| StmtError::ValidationFailure {
            format_id: self.id,
            reason: reason.to_string(),
        };
        let mut rd = MpRead::new(tuple);
        let count = rd.try_read_array().ok_or_else(|| fail("tuple is not a MessagePack array"))?;
        if let Some(exact) = self.exact_field_count {
            if count != exact {
                return Err(fail(&format!("expected exactly {exact} fields, got {count}")));
            }
        }
        if count < self.index_field_count {
            return Err(fail(&format!(
                "tuple has {count} fields, indexes reference {}",
                self.index_field_count
            )));
        }
        for i in 0..count {
            if rd.try_skip().is_none() {
                return Err(fail(&format!("field {i} is malformed or truncated")));
            }
        }
        if !rd.is_empty() {
            return Err(fail("trailing bytes after the field array"));
        }
        Ok(())
    }

    /// Compute the field-map offsets (payload-relative, `0` = absent) for
    /// a tuple. Tolerant of tuples that do not reach every indexed field:
    /// such slots stay `0`. Used by the non-validating construction path,
    /// so the tuple may predate the current schema.
    pub fn build_field_map(&self, tuple: &[u8]) -> Vec<u32> {
        let mut map = vec![0u32; self.slots as usize];
        self.collect_slots(&self.root, tuple, &mut Vec::new(), &mut map);
        map
    }

    fn collect_slots(
        &self,
        node: &FieldNode,
        tuple: &[u8],
        path: &mut Vec<FieldToken>,
        map: &mut Vec<u32>,
    ) {
        for child in &node.children {
            path.push(child.token.clone());
            if let Some(slot) = child.offset_slot {
                let (field_no, rest) = match path[0] {
                    FieldToken::Num(n) => (n, &path[1..]),
                    FieldToken::Str(_) => unreachable!("top-level tokens are positional"),
                };
                if let Some((start, _)) = locate_field(tuple, field_no, rest) {
                    map[slot as usize] = start as u32;
                }
            }
            self.collect_slots(child, tuple, path, map);
            path.pop();
        }
    }

    // ── statement pin counter (coordinator thread only) ──────────────────

    /// True when the current thread is the one this format was created on.
    pub fn on_coord_thread(&self) -> bool {
        thread::current().id() == self.coord
    }

    /// Account one more heap statement referencing this format.
    /// Must only be called from the coordinating thread.
    pub(crate) fn pin_stmt(&self) {
        debug_assert!(self.on_coord_thread(), "format pins are coordinator-thread-only");
        self.stmt_pins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unpin_stmt(&self) {
        debug_assert!(self.on_coord_thread(), "format pins are coordinator-thread-only");
        let prev = self.stmt_pins.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "format pin underflow");
    }

    /// Number of live coordinator-thread statements using this format.
    pub fn stmt_pin_count(&self) -> u64 {
        self.stmt_pins.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Vec<u8> {
        // [100, "name", [7, 8, 9], {"city": "oslo", "zip": 1234}]
        let mut out = Vec::new();
        msgpack::write_array(&mut out, 4);
        msgpack::write_uint(&mut out, 100);
        msgpack::write_str(&mut out, "name");
        msgpack::write_array(&mut out, 3);
        msgpack::write_uint(&mut out, 7);
        msgpack::write_uint(&mut out, 8);
        msgpack::write_uint(&mut out, 9);
        msgpack::write_map(&mut out, 2);
        msgpack::write_str(&mut out, "city");
        msgpack::write_str(&mut out, "oslo");
        msgpack::write_str(&mut out, "zip");
        msgpack::write_uint(&mut out, 1234);
        out
    }

    #[test]
    fn test_locate_top_level_field() {
        let row = row();
        let (start, end) = locate_field(&row, 1, &[]).unwrap();
        let mut rd = MpRead::new(&row[start..end]);
        assert_eq!(rd.read_str(), &b"name"[..]);
        assert!(locate_field(&row, 9, &[]).is_none());
    }

    #[test]
    fn test_locate_nested_array_and_map() {
        let row = row();
        let (start, end) = locate_field(&row, 2, &[FieldToken::Num(1)]).unwrap();
        let mut rd = MpRead::new(&row[start..end]);
        assert_eq!(rd.read_uint(), 8);

        let (start, end) = locate_field(&row, 3, &[FieldToken::str("zip")]).unwrap();
        let mut rd = MpRead::new(&row[start..end]);
        assert_eq!(rd.read_uint(), 1234);

        assert!(locate_field(&row, 3, &[FieldToken::str("country")]).is_none());
        assert!(locate_field(&row, 2, &[FieldToken::Num(5)]).is_none());
    }

    #[test]
    fn test_format_tree_marks_key_paths() {
        let pk = KeyDef::new(vec![KeyPart::field(0)]);
        let sk = KeyDef::new(vec![KeyPart::path(2, vec![FieldToken::Num(1)])]);
        let format = Format::new(FormatId(1), &[&pk, &sk]);

        assert_eq!(format.slot_count(), 2);
        assert_eq!(format.field_map_size(), 8);
        assert_eq!(format.index_field_count(), 3);
        assert_eq!(format.depth(), 2);

        let f0 = format.root().child_by_num(0).unwrap();
        assert!(f0.is_key_part());
        assert_eq!(f0.offset_slot(), Some(0));

        let f2 = format.root().child_by_num(2).unwrap();
        assert!(f2.is_key_part());
        assert!(f2.offset_slot().is_none()); // container, not a leaf part
        let nested = f2.child_by_num(1).unwrap();
        assert!(nested.is_key_part());
        assert_eq!(nested.offset_slot(), Some(1));

        assert!(format.root().child_by_num(1).is_none());
    }

    #[test]
    fn test_shared_leaf_gets_one_slot() {
        let a = KeyDef::new(vec![KeyPart::field(0), KeyPart::field(1)]);
        let b = KeyDef::new(vec![KeyPart::field(1)]);
        let format = Format::new(FormatId(2), &[&a, &b]);
        assert_eq!(format.slot_count(), 2);
    }

    #[test]
    fn test_validate_accepts_row_and_rejects_junk() {
        let pk = KeyDef::new(vec![KeyPart::field(0)]);
        let format = Format::new(FormatId(3), &[&pk]);
        assert!(format.validate(&row()).is_ok());

        assert!(matches!(
            format.validate(&[0xc0]),
            Err(StmtError::ValidationFailure { .. })
        ));

        let mut truncated = row();
        truncated.pop();
        assert!(format.validate(&truncated).is_err());

        let mut trailing = row();
        trailing.push(0xc0);
        assert!(format.validate(&trailing).is_err());

        // Indexes reference field 0, an empty tuple cannot satisfy them.
        let mut empty = Vec::new();
        msgpack::write_array(&mut empty, 0);
        assert!(format.validate(&empty).is_err());
    }

    #[test]
    fn test_validate_exact_field_count() {
        let pk = KeyDef::new(vec![KeyPart::field(0)]);
        let format = Format::new(FormatId(4), &[&pk]).with_exact_field_count(4);
        assert!(format.validate(&row()).is_ok());

        let mut short = Vec::new();
        msgpack::write_array(&mut short, 1);
        msgpack::write_uint(&mut short, 5);
        assert!(format.validate(&short).is_err());
    }

    #[test]
    fn test_build_field_map_offsets_point_at_values() {
        let pk = KeyDef::new(vec![KeyPart::field(1)]);
        let sk = KeyDef::new(vec![KeyPart::path(3, vec![FieldToken::str("zip")])]);
        let format = Format::new(FormatId(5), &[&pk, &sk]);
        let row = row();
        let map = format.build_field_map(&row);
        assert_eq!(map.len(), 2);

        let mut rd = MpRead::new(&row[map[0] as usize..]);
        assert_eq!(rd.read_str(), &b"name"[..]);
        let mut rd = MpRead::new(&row[map[1] as usize..]);
        assert_eq!(rd.read_uint(), 1234);
    }

    #[test]
    fn test_build_field_map_missing_field_stays_zero() {
        let pk = KeyDef::new(vec![KeyPart::field(0)]);
        let sk = KeyDef::new(vec![KeyPart::field(6)]);
        let format = Format::new(FormatId(6), &[&pk, &sk]);
        let map = format.build_field_map(&row());
        assert_ne!(map[0], 0); // field 0 sits after the array header
        assert_eq!(map[1], 0);
    }

    #[test]
    fn test_key_extract_raw_builds_bare_key() {
        let def = KeyDef::new(vec![
            KeyPart::field(0),
            KeyPart::path(3, vec![FieldToken::str("city")]),
        ]);
        let mut region = RegionArena::with_capacity(4096);
        let row = row();
        let key = def.extract_raw(&row, &mut region).unwrap().to_vec();
        let mut rd = MpRead::new(&key);
        assert_eq!(rd.read_array(), 2);
        assert_eq!(rd.read_uint(), 100);
        assert_eq!(rd.read_str(), &b"oslo"[..]);
    }

    #[test]
    fn test_key_extract_missing_part_is_nil() {
        let def = KeyDef::new(vec![KeyPart::field(9)]);
        let mut region = RegionArena::with_capacity(256);
        let key = def.extract_raw(&row(), &mut region).unwrap();
        let mut rd = MpRead::new(key);
        assert_eq!(rd.read_array(), 1);
        assert_eq!(rd.peek_type(), MpType::Nil);
    }
}
