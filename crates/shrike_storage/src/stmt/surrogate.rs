//! Surrogate DELETE derivation.
//!
//! Secondary indexes never need the full row to delete it, only the
//! indexed fields. A surrogate DELETE keeps those fields verbatim and
//! replaces everything else with nil, so it compares equal to the
//! original row in every index while costing a fraction of the bytes.
//!
//! The walk over the source tuple runs in one pass with an explicit
//! frame stack whose depth is bounded by the format's indexed-nesting
//! depth. Scratch memory comes from the caller's arena and is rolled
//! back before returning, on success and on failure alike.

use shrike_common::error::StmtError;

use crate::format::{FieldNode, Format};
use crate::msgpack::{MpRead, MpType, MpWrite};
use crate::stmt::build::{HeapStmt, StmtEnv};
use crate::stmt::layout::{self, StmtKind, StmtRead, STMT_HEADER_SIZE};
use crate::stmt::region::RegionArena;

use std::sync::Arc;

/// One nesting level of the walk: the field-tree node whose children we
/// are visiting and how many elements (or map pairs) remain.
struct Frame<'f> {
    node: &'f FieldNode,
    is_map: bool,
    remaining: u32,
    idx: u32,
}

/// Derive a surrogate DELETE from a statement's row tuple.
pub fn surrogate_delete<S: StmtRead>(
    env: &StmtEnv,
    format: &Arc<Format>,
    stmt: &S,
    region: &mut RegionArena,
) -> Result<HeapStmt, StmtError> {
    debug_assert!(!stmt.is_key(), "surrogates are derived from full rows");
    surrogate_delete_raw(env, format, stmt.tuple_data(), region)
}

/// Derive a surrogate DELETE from raw row-tuple bytes.
///
/// The output tuple has `min(field count, indexed field count)` fields:
/// indexed leaves are copied verbatim, indexed containers are descended
/// into (unless the frame stack is already at the format's depth, in
/// which case the whole container is copied), and everything else
/// becomes nil. Field-map offsets are recorded against the output
/// payload as the walk passes each indexed leaf.
pub fn surrogate_delete_raw(
    env: &StmtEnv,
    format: &Arc<Format>,
    src: &[u8],
    region: &mut RegionArena,
) -> Result<HeapStmt, StmtError> {
    let svp = region.used();
    let res = build(env, format, src, region);
    region.truncate(svp);
    res
}

fn build(
    env: &StmtEnv,
    format: &Arc<Format>,
    src: &[u8],
    region: &mut RegionArena,
) -> Result<HeapStmt, StmtError> {
    let fm_size = format.field_map_size() as usize;
    // Nil is never longer than the value it replaces, so the output
    // payload fits in the source's footprint.
    let scratch = region.alloc(fm_size + src.len(), "surrogate scratch")?;
    let (fm_buf, data_buf) = scratch.split_at_mut(fm_size);

    let mut rd = MpRead::new(src);
    let src_count = rd.read_array();
    let field_count = src_count.min(format.index_field_count());
    let depth = format.depth() as usize;

    let mut wr = MpWrite::new(data_buf);
    wr.array(field_count);

    let mut stack: Vec<Frame<'_>> = Vec::with_capacity(depth);
    stack.push(Frame {
        node: format.root(),
        is_map: false,
        remaining: field_count,
        idx: 0,
    });

    while let Some(frame) = stack.last_mut() {
        if frame.remaining == 0 {
            stack.pop();
            continue;
        }
        frame.remaining -= 1;
        let is_map = frame.is_map;
        let parent = frame.node;
        let idx = frame.idx;
        frame.idx += 1;

        let child = if is_map {
            // Map keys are emitted to the output; pairs with non-string
            // keys cannot be indexed and are dropped from the surrogate
            // entirely.
            if rd.peek_type() != MpType::Str {
                rd.skip();
                rd.skip();
                continue;
            }
            let key = rd.read_str();
            wr.str_bytes(key);
            parent.child_by_str(key)
        } else {
            parent.child_by_num(idx)
        };

        let node = match child {
            Some(node) if node.is_key_part() => node,
            _ => {
                rd.skip();
                wr.nil();
                continue;
            }
        };

        // The offset goes down before the value so it points at the
        // value's first byte in the output payload.
        if let Some(slot) = node.offset_slot() {
            layout::set_field_map_slot(fm_buf, slot, wr.pos() as u32);
        }

        let vtype = rd.peek_type();
        let is_container = vtype == MpType::Array || vtype == MpType::Map;
        if is_container && node.has_children() && stack.len() < depth {
            if vtype == MpType::Array {
                let n = rd.read_array();
                wr.array(n);
                stack.push(Frame {
                    node,
                    is_map: false,
                    remaining: n,
                    idx: 0,
                });
            } else {
                let n = rd.read_map();
                wr.map(n);
                stack.push(Frame {
                    node,
                    is_map: true,
                    remaining: n,
                    idx: 0,
                });
            }
        } else {
            let start = rd.pos();
            rd.skip();
            wr.raw(&src[start..rd.pos()]);
        }
    }

    let bsize = wr.pos();
    debug_assert!(bsize <= src.len());

    let mut buf = env.alloc_buf(format, bsize as u32)?;
    buf[STMT_HEADER_SIZE..STMT_HEADER_SIZE + fm_size].copy_from_slice(fm_buf);
    buf[STMT_HEADER_SIZE + fm_size..].copy_from_slice(&data_buf[..bsize]);
    layout::set_kind(&mut buf, StmtKind::Delete);
    Ok(HeapStmt::from_buf(format, buf))
}
