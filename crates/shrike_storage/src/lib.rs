//! Storage-layer statement model: schema formats, the MessagePack codec
//! they share, and the statement types flowing through the LSM tree.

pub mod format;
pub mod msgpack;
pub mod stmt;

pub use format::{FieldToken, Format, KeyDef, KeyPart};
pub use stmt::{HeapStmt, StmtEnv, StmtEnvConfig, StmtFlags, StmtKind, StmtRead};
