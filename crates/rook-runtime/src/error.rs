//! Runtime error type.

use thiserror::Error;

/// A runtime failure.
///
/// The VM prints the message and the stack trace to standard error at the
/// point of failure and resets the stack; the error value carries both for
/// callers that want to inspect them.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RuntimeError {
    /// The failure message, e.g. `Undefined variable 'x'.`
    pub message: String,
    /// One rendered line per active frame, innermost first, e.g.
    /// `[line 4] in counter()`.
    pub trace: Vec<String>,
}
