//! Shared foundation for the shrike storage engine: core identifier
//! newtypes and the error taxonomy every crate converts into.

pub mod error;
pub mod types;

pub use error::{ShrikeError, ShrikeResult, StmtError};
pub use types::{FormatId, Lsn, SpaceId};
