//! Error taxonomy.
//!
//! Recoverable failures are explicit `Result` values built from the enums
//! below. Programming-error invariants (malformed MessagePack handed to
//! the surrogate walk, releasing a log-owned statement, mutating schema
//! pins off the coordinating thread) are assertions, not variants: they
//! signal caller misuse, never a runtime data condition.

use thiserror::Error;

use crate::types::FormatId;

/// Convenience alias for `Result<T, ShrikeError>`.
pub type ShrikeResult<T> = Result<T, ShrikeError>;

/// Top-level error type that crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum ShrikeError {
    #[error("Statement error: {0}")]
    Stmt(#[from] StmtError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Statement-model errors.
///
/// None of these are retried internally; retry policy belongs to the
/// surrounding transaction or compaction layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StmtError {
    /// An allocator (heap, arena or log region) could not satisfy a
    /// request. Always propagated, never retried here.
    #[error("out of memory: {requested} bytes for {context}")]
    OutOfMemory {
        requested: usize,
        context: &'static str,
    },

    /// The computed statement size exceeds the configured maximum.
    /// Reported before any allocation is performed.
    #[error("statement size {size} exceeds the {max} byte limit")]
    OversizeStatement { size: usize, max: usize },

    /// Raw tuple bytes failed schema validation on a validating
    /// constructor.
    #[error("tuple does not match format {format_id}: {reason}")]
    ValidationFailure { format_id: FormatId, reason: String },

    /// A wire record carries an opcode the decoder does not recognize.
    #[error("corrupt record: unknown request type {opcode}")]
    CorruptRecord { opcode: u8 },

    /// A wire record is missing the body its opcode requires, or carries
    /// unreadable metadata.
    #[error("corrupt record: malformed {op} record ({reason})")]
    MalformedRecord { op: &'static str, reason: &'static str },
}
