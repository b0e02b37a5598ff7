//! MessagePack primitives for statement payloads.
//!
//! Statement payloads, bare keys and upsert operation blocks are all
//! MessagePack arrays. This module provides the small codec surface the
//! statement model needs: canonical encoders, header decoders, an
//! iterative `skip`, and a diagnostic dump for the printer.
//!
//! ## Contract
//!
//! Payload bytes reaching the readers below have already been validated
//! (either by a validating constructor or by a previously validated wire
//! record). The panicking accessors (`skip`, `read_array`, ...) therefore
//! treat malformed input as caller misuse and abort; the `try_*` variants
//! exist for the validation path itself and for the diagnostic printer.
//!
//! Extension types are never produced by this engine and are treated as
//! malformed.

use std::fmt::Write as _;

/// Logical type of a MessagePack value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpType {
    Nil,
    Bool,
    Uint,
    Int,
    Float,
    Str,
    Bin,
    Array,
    Map,
}

/// Classify a marker byte. Returns `None` for reserved and extension
/// markers.
pub const fn value_type(marker: u8) -> Option<MpType> {
    match marker {
        0x00..=0x7f => Some(MpType::Uint),
        0x80..=0x8f => Some(MpType::Map),
        0x90..=0x9f => Some(MpType::Array),
        0xa0..=0xbf => Some(MpType::Str),
        0xc0 => Some(MpType::Nil),
        0xc2 | 0xc3 => Some(MpType::Bool),
        0xc4..=0xc6 => Some(MpType::Bin),
        0xca | 0xcb => Some(MpType::Float),
        0xcc..=0xcf => Some(MpType::Uint),
        0xd0..=0xd3 => Some(MpType::Int),
        0xd9..=0xdb => Some(MpType::Str),
        0xdc | 0xdd => Some(MpType::Array),
        0xde | 0xdf => Some(MpType::Map),
        0xe0..=0xff => Some(MpType::Int),
        _ => None, // 0xc1 reserved, ext families
    }
}

/// Encoded size of an array header with `n` elements.
pub const fn sizeof_array(n: u32) -> usize {
    match n {
        0..=15 => 1,
        16..=65535 => 3,
        _ => 5,
    }
}

/// Encoded size of an unsigned integer.
pub const fn sizeof_uint(v: u64) -> usize {
    match v {
        0..=0x7f => 1,
        0x80..=0xff => 2,
        0x100..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

// ── Vec-based encoders (canonical, smallest form) ────────────────────────────

pub fn write_nil(out: &mut Vec<u8>) {
    out.push(0xc0);
}

pub fn write_bool(out: &mut Vec<u8>, v: bool) {
    out.push(if v { 0xc3 } else { 0xc2 });
}

pub fn write_uint(out: &mut Vec<u8>, v: u64) {
    match v {
        0..=0x7f => out.push(v as u8),
        0x80..=0xff => {
            out.push(0xcc);
            out.push(v as u8);
        }
        0x100..=0xffff => {
            out.push(0xcd);
            out.extend_from_slice(&(v as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xce);
            out.extend_from_slice(&(v as u32).to_be_bytes());
        }
        _ => {
            out.push(0xcf);
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
}

pub fn write_int(out: &mut Vec<u8>, v: i64) {
    if v >= 0 {
        return write_uint(out, v as u64);
    }
    if v >= -32 {
        out.push(v as u8);
    } else if v >= i64::from(i8::MIN) {
        out.push(0xd0);
        out.push(v as u8);
    } else if v >= i64::from(i16::MIN) {
        out.push(0xd1);
        out.extend_from_slice(&(v as i16).to_be_bytes());
    } else if v >= i64::from(i32::MIN) {
        out.push(0xd2);
        out.extend_from_slice(&(v as i32).to_be_bytes());
    } else {
        out.push(0xd3);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

pub fn write_f64(out: &mut Vec<u8>, v: f64) {
    out.push(0xcb);
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_str(out: &mut Vec<u8>, s: &str) {
    write_str_bytes(out, s.as_bytes());
}

pub fn write_str_bytes(out: &mut Vec<u8>, s: &[u8]) {
    let n = s.len();
    if n <= 31 {
        out.push(0xa0 | n as u8);
    } else if n <= 0xff {
        out.push(0xd9);
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xda);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        out.push(0xdb);
        out.extend_from_slice(&(n as u32).to_be_bytes());
    }
    out.extend_from_slice(s);
}

pub fn write_bin(out: &mut Vec<u8>, b: &[u8]) {
    let n = b.len();
    if n <= 0xff {
        out.push(0xc4);
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xc5);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        out.push(0xc6);
        out.extend_from_slice(&(n as u32).to_be_bytes());
    }
    out.extend_from_slice(b);
}

pub fn write_array(out: &mut Vec<u8>, n: u32) {
    if n <= 15 {
        out.push(0x90 | n as u8);
    } else if n <= 0xffff {
        out.push(0xdc);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        out.push(0xdd);
        out.extend_from_slice(&n.to_be_bytes());
    }
}

pub fn write_map(out: &mut Vec<u8>, n: u32) {
    if n <= 15 {
        out.push(0x80 | n as u8);
    } else if n <= 0xffff {
        out.push(0xde);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        out.push(0xdf);
        out.extend_from_slice(&n.to_be_bytes());
    }
}

// ── Slice-based writer (arena scratch output) ────────────────────────────────

/// Cursor writing MessagePack into a fixed scratch buffer.
///
/// Used by the surrogate walk, whose output is provably no larger than its
/// input; overflowing the scratch buffer is an internal invariant failure.
pub struct MpWrite<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> MpWrite<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        MpWrite { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn pos(&self) -> usize {
        self.pos
    }

    fn push(&mut self, b: u8) {
        assert!(self.pos < self.buf.len(), "scratch buffer overflow");
        self.buf[self.pos] = b;
        self.pos += 1;
    }

    /// Copy pre-encoded MessagePack bytes verbatim.
    pub fn raw(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        assert!(end <= self.buf.len(), "scratch buffer overflow");
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }

    pub fn nil(&mut self) {
        self.push(0xc0);
    }

    pub fn array(&mut self, n: u32) {
        if n <= 15 {
            self.push(0x90 | n as u8);
        } else if n <= 0xffff {
            self.push(0xdc);
            self.raw(&(n as u16).to_be_bytes());
        } else {
            self.push(0xdd);
            self.raw(&n.to_be_bytes());
        }
    }

    pub fn map(&mut self, n: u32) {
        if n <= 15 {
            self.push(0x80 | n as u8);
        } else if n <= 0xffff {
            self.push(0xde);
            self.raw(&(n as u16).to_be_bytes());
        } else {
            self.push(0xdf);
            self.raw(&n.to_be_bytes());
        }
    }

    pub fn str_bytes(&mut self, s: &[u8]) {
        let n = s.len();
        if n <= 31 {
            self.push(0xa0 | n as u8);
        } else if n <= 0xff {
            self.push(0xd9);
            self.push(n as u8);
        } else if n <= 0xffff {
            self.push(0xda);
            self.raw(&(n as u16).to_be_bytes());
        } else {
            self.push(0xdb);
            self.raw(&(n as u32).to_be_bytes());
        }
        self.raw(s);
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Cursor over MessagePack bytes.
#[derive(Clone)]
pub struct MpRead<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MpRead<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        MpRead { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let s = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(s)
    }

    fn take_u16(&mut self) -> Option<u16> {
        let s = self.take(2)?;
        Some(u16::from_be_bytes([s[0], s[1]]))
    }

    fn take_u32(&mut self) -> Option<u32> {
        let s = self.take(4)?;
        Some(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    /// Type of the next value. Panics on truncated or reserved input.
    pub fn peek_type(&self) -> MpType {
        let b = self.buf.get(self.pos).copied().expect("malformed msgpack: truncated");
        value_type(b).expect("malformed msgpack: reserved marker")
    }

    pub fn try_peek_type(&self) -> Option<MpType> {
        value_type(*self.buf.get(self.pos)?)
    }

    pub fn try_read_array(&mut self) -> Option<u32> {
        match self.take_u8()? {
            b @ 0x90..=0x9f => Some(u32::from(b & 0x0f)),
            0xdc => self.take_u16().map(u32::from),
            0xdd => self.take_u32(),
            _ => None,
        }
    }

    /// Decode an array header. Panics unless the next value is an array.
    pub fn read_array(&mut self) -> u32 {
        self.try_read_array().expect("malformed msgpack: expected array")
    }

    pub fn try_read_map(&mut self) -> Option<u32> {
        match self.take_u8()? {
            b @ 0x80..=0x8f => Some(u32::from(b & 0x0f)),
            0xde => self.take_u16().map(u32::from),
            0xdf => self.take_u32(),
            _ => None,
        }
    }

    pub fn read_map(&mut self) -> u32 {
        self.try_read_map().expect("malformed msgpack: expected map")
    }

    pub fn try_read_uint(&mut self) -> Option<u64> {
        match self.take_u8()? {
            b @ 0x00..=0x7f => Some(u64::from(b)),
            0xcc => self.take_u8().map(u64::from),
            0xcd => self.take_u16().map(u64::from),
            0xce => self.take_u32().map(u64::from),
            0xcf => {
                let s = self.take(8)?;
                Some(u64::from_be_bytes(s.try_into().ok()?))
            }
            _ => None,
        }
    }

    pub fn read_uint(&mut self) -> u64 {
        self.try_read_uint().expect("malformed msgpack: expected uint")
    }

    pub fn try_read_str(&mut self) -> Option<&'a [u8]> {
        let n = match self.take_u8()? {
            b @ 0xa0..=0xbf => usize::from(b & 0x1f),
            0xd9 => usize::from(self.take_u8()?),
            0xda => usize::from(self.take_u16()?),
            0xdb => self.take_u32()? as usize,
            _ => return None,
        };
        self.take(n)
    }

    pub fn read_str(&mut self) -> &'a [u8] {
        self.try_read_str().expect("malformed msgpack: expected str")
    }

    /// Skip one value, however deeply nested.
    ///
    /// Iterative: a pending-value counter replaces recursion, so depth is
    /// bounded regardless of input shape.
    pub fn try_skip(&mut self) -> Option<()> {
        let mut pending: u64 = 1;
        while pending > 0 {
            pending -= 1;
            match self.take_u8()? {
                0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => {}
                b @ 0x80..=0x8f => pending += 2 * u64::from(b & 0x0f),
                b @ 0x90..=0x9f => pending += u64::from(b & 0x0f),
                b @ 0xa0..=0xbf => {
                    self.take(usize::from(b & 0x1f))?;
                }
                0xc4 | 0xd9 => {
                    let n = self.take_u8()?;
                    self.take(usize::from(n))?;
                }
                0xc5 | 0xda => {
                    let n = self.take_u16()?;
                    self.take(usize::from(n))?;
                }
                0xc6 | 0xdb => {
                    let n = self.take_u32()?;
                    self.take(n as usize)?;
                }
                0xcc | 0xd0 => {
                    self.take(1)?;
                }
                0xcd | 0xd1 => {
                    self.take(2)?;
                }
                0xca | 0xce | 0xd2 => {
                    self.take(4)?;
                }
                0xcb | 0xcf | 0xd3 => {
                    self.take(8)?;
                }
                0xdc => {
                    let n = self.take_u16()?;
                    pending += u64::from(n);
                }
                0xdd => {
                    let n = self.take_u32()?;
                    pending += u64::from(n);
                }
                0xde => {
                    let n = self.take_u16()?;
                    pending += 2 * u64::from(n);
                }
                0xdf => {
                    let n = self.take_u32()?;
                    pending += 2 * u64::from(n);
                }
                _ => return None, // reserved / ext
            }
        }
        Some(())
    }

    pub fn skip(&mut self) {
        self.try_skip().expect("malformed msgpack: truncated or reserved value");
    }
}

// ── Diagnostic dump ──────────────────────────────────────────────────────────

const MAX_DUMP_DEPTH: usize = 32;

/// Render one MessagePack value as human-readable text.
///
/// Diagnostic-only: malformed input yields `<corrupt>` rather than a
/// panic, and nesting beyond [`MAX_DUMP_DEPTH`] is elided.
pub fn dump(data: &[u8]) -> String {
    let mut rd = MpRead::new(data);
    let mut out = String::new();
    if dump_value(&mut rd, &mut out, 0).is_none() {
        out.push_str("<corrupt>");
    }
    out
}

fn dump_value(rd: &mut MpRead<'_>, out: &mut String, depth: usize) -> Option<()> {
    if depth >= MAX_DUMP_DEPTH {
        rd.try_skip()?;
        out.push_str("...");
        return Some(());
    }
    match rd.try_peek_type()? {
        MpType::Nil => {
            rd.try_skip()?;
            out.push_str("null");
        }
        MpType::Bool => {
            let start = rd.pos();
            rd.try_skip()?;
            out.push_str(if rd.buf[start] == 0xc3 { "true" } else { "false" });
        }
        MpType::Uint => {
            let v = rd.try_read_uint()?;
            let _ = write!(out, "{v}");
        }
        MpType::Int => {
            let v = dump_read_int(rd)?;
            let _ = write!(out, "{v}");
        }
        MpType::Float => {
            let v = dump_read_float(rd)?;
            let _ = write!(out, "{v}");
        }
        MpType::Str => {
            let s = rd.try_read_str()?;
            let _ = write!(out, "\"{}\"", String::from_utf8_lossy(s));
        }
        MpType::Bin => {
            let start = rd.pos();
            rd.try_skip()?;
            let _ = write!(out, "<bin {}>", rd.pos() - start);
        }
        MpType::Array => {
            let n = rd.try_read_array()?;
            out.push('[');
            for i in 0..n {
                if i > 0 {
                    out.push_str(", ");
                }
                dump_value(rd, out, depth + 1)?;
            }
            out.push(']');
        }
        MpType::Map => {
            let n = rd.try_read_map()?;
            out.push('{');
            for i in 0..n {
                if i > 0 {
                    out.push_str(", ");
                }
                dump_value(rd, out, depth + 1)?;
                out.push_str(": ");
                dump_value(rd, out, depth + 1)?;
            }
            out.push('}');
        }
    }
    Some(())
}

fn dump_read_int(rd: &mut MpRead<'_>) -> Option<i64> {
    match rd.take_u8()? {
        b @ 0xe0..=0xff => Some(i64::from(b as i8)),
        0xd0 => Some(i64::from(rd.take_u8()? as i8)),
        0xd1 => Some(i64::from(rd.take_u16()? as i16)),
        0xd2 => Some(i64::from(rd.take_u32()? as i32)),
        0xd3 => {
            let s = rd.take(8)?;
            Some(i64::from_be_bytes(s.try_into().ok()?))
        }
        _ => None,
    }
}

fn dump_read_float(rd: &mut MpRead<'_>) -> Option<f64> {
    match rd.take_u8()? {
        0xca => {
            let s = rd.take(4)?;
            Some(f64::from(f32::from_be_bytes(s.try_into().ok()?)))
        }
        0xcb => {
            let s = rd.take(8)?;
            Some(f64::from_be_bytes(s.try_into().ok()?))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tuple() -> Vec<u8> {
        // [17, "abc", null, [1, 2], {"k": -5}]
        let mut out = Vec::new();
        write_array(&mut out, 5);
        write_uint(&mut out, 17);
        write_str(&mut out, "abc");
        write_nil(&mut out);
        write_array(&mut out, 2);
        write_uint(&mut out, 1);
        write_uint(&mut out, 2);
        write_map(&mut out, 1);
        write_str(&mut out, "k");
        write_int(&mut out, -5);
        out
    }

    #[test]
    fn test_skip_consumes_exactly_one_value() {
        let buf = sample_tuple();
        let mut rd = MpRead::new(&buf);
        rd.skip();
        assert_eq!(rd.pos(), buf.len());
        assert!(rd.is_empty());
    }

    #[test]
    fn test_skip_each_element() {
        let buf = sample_tuple();
        let mut rd = MpRead::new(&buf);
        let n = rd.read_array();
        assert_eq!(n, 5);
        for _ in 0..n {
            rd.skip();
        }
        assert!(rd.is_empty());
    }

    #[test]
    fn test_try_skip_rejects_truncation() {
        let buf = sample_tuple();
        for cut in 1..buf.len() {
            let mut rd = MpRead::new(&buf[..cut]);
            assert!(rd.try_skip().is_none(), "cut at {} accepted", cut);
        }
    }

    #[test]
    fn test_try_skip_rejects_reserved_marker() {
        let mut rd = MpRead::new(&[0xc1]);
        assert!(rd.try_skip().is_none());
    }

    #[test]
    fn test_uint_boundaries_roundtrip() {
        for v in [0u64, 0x7f, 0x80, 0xff, 0x100, 0xffff, 0x1_0000, u64::from(u32::MAX), u64::MAX] {
            let mut out = Vec::new();
            write_uint(&mut out, v);
            assert_eq!(out.len(), sizeof_uint(v));
            let mut rd = MpRead::new(&out);
            assert_eq!(rd.read_uint(), v);
            assert!(rd.is_empty());
        }
    }

    #[test]
    fn test_array_header_sizes() {
        for n in [0u32, 15, 16, 65535, 65536] {
            let mut out = Vec::new();
            write_array(&mut out, n);
            assert_eq!(out.len(), sizeof_array(n));
            let mut rd = MpRead::new(&out);
            assert_eq!(rd.read_array(), n);
        }
    }

    #[test]
    fn test_str_long_forms() {
        for len in [0usize, 31, 32, 255, 256] {
            let s = vec![b'x'; len];
            let mut out = Vec::new();
            write_str_bytes(&mut out, &s);
            let mut rd = MpRead::new(&out);
            assert_eq!(rd.read_str(), &s[..]);
        }
    }

    #[test]
    fn test_slice_writer_matches_vec_encoders() {
        let mut expect = Vec::new();
        write_array(&mut expect, 3);
        write_nil(&mut expect);
        write_str(&mut expect, "key");
        write_map(&mut expect, 0);

        let mut buf = vec![0u8; expect.len()];
        let mut wr = MpWrite::new(&mut buf);
        wr.array(3);
        wr.nil();
        wr.str_bytes(b"key");
        wr.map(0);
        assert_eq!(wr.pos(), expect.len());
        assert_eq!(buf, expect);
    }

    #[test]
    fn test_dump_renders_nested_values() {
        let buf = sample_tuple();
        assert_eq!(dump(&buf), r#"[17, "abc", null, [1, 2], {"k": -5}]"#);
    }

    #[test]
    fn test_dump_tolerates_corrupt_input() {
        let out = dump(&[0xdc, 0x00]);
        assert!(out.contains("<corrupt>"));
    }
}
