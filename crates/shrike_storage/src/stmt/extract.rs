//! Key extraction: row tuple -> bare-key statement.

use std::sync::Arc;

use shrike_common::error::StmtError;

use crate::format::{Format, KeyDef};
use crate::msgpack::MpRead;
use crate::stmt::build::{new_key, HeapStmt, StmtEnv};
use crate::stmt::layout::StmtRead;
use crate::stmt::region::RegionArena;

/// Extract an index key from a statement's row tuple as a bare-key
/// statement in the given (key-only) format.
///
/// Scratch for the materialized key comes from the caller's arena and is
/// rolled back before returning.
pub fn extract_key<S: StmtRead>(
    env: &StmtEnv,
    stmt: &S,
    key_def: &KeyDef,
    format: &Arc<Format>,
    region: &mut RegionArena,
) -> Result<HeapStmt, StmtError> {
    debug_assert!(!stmt.is_key(), "keys are extracted from full rows");
    extract_key_raw(env, stmt.tuple_data(), key_def, format, region)
}

/// Extract an index key from raw row-tuple bytes.
pub fn extract_key_raw(
    env: &StmtEnv,
    tuple: &[u8],
    key_def: &KeyDef,
    format: &Arc<Format>,
    region: &mut RegionArena,
) -> Result<HeapStmt, StmtError> {
    let svp = region.used();
    let res = build(env, tuple, key_def, format, region);
    region.truncate(svp);
    res
}

fn build(
    env: &StmtEnv,
    tuple: &[u8],
    key_def: &KeyDef,
    format: &Arc<Format>,
    region: &mut RegionArena,
) -> Result<HeapStmt, StmtError> {
    let key = key_def.extract_raw(tuple, region)?;
    let mut rd = MpRead::new(key);
    let part_count = rd.read_array();
    debug_assert_eq!(part_count, key_def.part_count());
    new_key(env, format, &key[rd.pos()..], part_count)
}
