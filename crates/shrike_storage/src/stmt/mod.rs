//! Statement model of the LSM engine.
//!
//! Every change to a space flows through the tree as a statement: a row
//! tuple (or bare key) stamped with an operation kind and a version.
//! One packed buffer layout serves three ownership regimes:
//!
//! ```text
//!   constructors ──► HeapStmt   (refcounted, transaction write set, cache)
//!        │               │ dup_into_log
//!        │               ▼
//!        │           LogStmt    (append-only region behind the memory index)
//!        │
//!        └──────────► ArenaStmt (worker scratch, reclaimed by watermark)
//! ```
//!
//! Derivations keep the write path cheap: a surrogate DELETE carries only
//! the indexed fields, key extraction materializes just what an index
//! compares, and the wire codec strips whatever the target index does not
//! need before a record hits the log.

pub mod bloom;
pub mod build;
pub mod codec;
pub mod extract;
pub mod layout;
pub mod log;
pub mod print;
pub mod region;
pub mod surrogate;

pub use bloom::{KeyBloom, KeyBloomBuilder};
pub use build::{
    dup, dup_into_log, key_dup, new_delete, new_insert, new_key, new_replace, new_upsert,
    new_with_ops, replace_from_upsert, HeapStmt, StmtEnv, StmtEnvConfig,
};
pub use codec::{decode, encode_primary, encode_secondary, RecordOp, WireRecord};
pub use extract::{extract_key, extract_key_raw};
pub use layout::{StmtFlags, StmtKind, StmtRead, STMT_HEADER_SIZE};
pub use log::{LogStmt, StmtLog};
pub use print::{render, stmt_str};
pub use region::{ArenaStmt, RegionArena};
pub use surrogate::{surrogate_delete, surrogate_delete_raw};
