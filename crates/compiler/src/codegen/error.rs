//! Back-end error types.

use std::fmt;

/// Error raised by lowering, encoding or container writing.
///
/// The back end fails fast: the first error aborts the compilation and is
/// surfaced as a single diagnostic by the driver.
#[derive(Debug)]
pub enum CodeGenError {
    /// An IR shape the back end cannot lower.
    Unsupported(String),
    /// A call or import that resolves to nothing.
    UndefinedSymbol(String),
    /// A branch or data reference to a label that was never defined.
    UndefinedLabel(String),
    /// Encoding failure (displacement out of range and similar).
    Encoding(String),
    /// Section layout failure in the container writer.
    Layout(String),
}

impl fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeGenError::Unsupported(s) => write!(f, "unsupported operation: {}", s),
            CodeGenError::UndefinedSymbol(s) => write!(f, "undefined symbol `{}`", s),
            CodeGenError::UndefinedLabel(s) => write!(f, "undefined label `{}`", s),
            CodeGenError::Encoding(s) => write!(f, "encoding error: {}", s),
            CodeGenError::Layout(s) => write!(f, "layout error: {}", s),
        }
    }
}

impl std::error::Error for CodeGenError {}

impl From<String> for CodeGenError {
    fn from(s: String) -> Self {
        CodeGenError::Encoding(s)
    }
}
