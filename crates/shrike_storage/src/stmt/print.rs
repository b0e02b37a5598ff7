//! Human-readable statement rendering for logs and panics.

use crate::msgpack;
use crate::stmt::layout::{StmtKind, StmtRead};

/// Render a statement as `KIND([fields], lsn=N)`, with the operations
/// block for upserts. `None` renders as `<NULL>`, bare keys as just the
/// key array. Diagnostic-only: corrupt payloads render as `<corrupt>`
/// instead of failing.
pub fn stmt_str<S: StmtRead>(stmt: Option<&S>) -> String {
    let Some(stmt) = stmt else {
        return "<NULL>".to_string();
    };
    let kind = stmt.kind();
    if kind == StmtKind::Raw {
        return msgpack::dump(stmt.payload());
    }
    let mut out = format!("{}({}", kind.name(), msgpack::dump(stmt.tuple_data()));
    if kind == StmtKind::Upsert {
        out.push_str(", ops=");
        out.push_str(&msgpack::dump(stmt.upsert_ops()));
    }
    out.push_str(&format!(", lsn={})", stmt.lsn()));
    out
}

/// Render into a fixed-size buffer, truncating on overflow.
///
/// Returns the length the full rendering would need, like `snprintf`;
/// callers detect truncation by comparing it against the buffer size.
pub fn render<S: StmtRead>(stmt: Option<&S>, out: &mut [u8]) -> usize {
    let text = stmt_str(stmt);
    let n = text.len().min(out.len());
    out[..n].copy_from_slice(&text.as_bytes()[..n]);
    text.len()
}
