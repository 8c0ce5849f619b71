//! Structured diagnostics shared by every stage of the pipeline.
//!
//! Stages never print directly; they append records to a [`Diagnostics`]
//! sink owned by the driver. Each record carries a stable code (`E…`/`W…`)
//! so tooling can match on it across releases, plus the source location the
//! problem originated from and an optional hint.

use std::fmt;
use std::path::{Path, PathBuf};

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
    Info,
    Hint,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Info => "info",
            Level::Hint => "hint",
        };
        f.write_str(s)
    }
}

/// Stable diagnostic codes.
///
/// The numbering is append-only: codes are never reused or renumbered once
/// they have shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    // Lexical
    InvalidCharacter,
    UnterminatedString,
    // Syntactic
    UnexpectedToken,
    MissingToken,
    // Types
    TypeMismatch,
    UndefinedType,
    IncompatibleTypes,
    // Names
    UndefinedVariable,
    UndefinedFunction,
    UndefinedClass,
    UndefinedMember,
    // Classes and interfaces
    AbstractInstantiation,
    MissingOverride,
    InvalidOverride,
    InterfaceViolation,
    Redefinition,
    // Back end
    UndefinedLabel,
    UndefinedSymbol,
    UnsupportedShape,
    WriteFailure,
    LayoutOverflow,
    // Catch-alls kept for compatibility with older tooling
    TypeError,
    CompilationError,
    // Warnings
    UnusedSymbol,
    MissingReturn,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Code::InvalidCharacter => "E001",
            Code::UnterminatedString => "E002",
            Code::UnexpectedToken => "E003",
            Code::MissingToken => "E004",
            Code::TypeMismatch => "E005",
            Code::UndefinedType => "E006",
            Code::IncompatibleTypes => "E007",
            Code::UndefinedVariable => "E008",
            Code::UndefinedFunction => "E009",
            Code::UndefinedClass => "E010",
            Code::UndefinedMember => "E011",
            Code::AbstractInstantiation => "E012",
            Code::MissingOverride => "E013",
            Code::InvalidOverride => "E014",
            Code::InterfaceViolation => "E015",
            Code::Redefinition => "E016",
            Code::UndefinedLabel => "E017",
            Code::UndefinedSymbol => "E018",
            Code::UnsupportedShape => "E019",
            Code::WriteFailure => "E020",
            Code::LayoutOverflow => "E021",
            Code::TypeError => "E998",
            Code::CompilationError => "E999",
            Code::UnusedSymbol => "W001",
            Code::MissingReturn => "W002",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single diagnostic record.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: Level,
    pub code: Code,
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub hint: Option<String>,
}

/// Append-only diagnostics sink for one compilation.
///
/// Records are kept in emission order. The sink is the only mutable state
/// shared between pipeline stages.
#[derive(Debug)]
pub struct Diagnostics {
    file: PathBuf,
    records: Vec<Diagnostic>,
    errors: usize,
    warnings: usize,
}

impl Diagnostics {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Diagnostics {
            file: file.into(),
            records: Vec::new(),
            errors: 0,
            warnings: 0,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn error(&mut self, code: Code, message: impl Into<String>, line: u32, column: u32) {
        self.emit(Level::Error, code, message.into(), line, column, None);
    }

    pub fn error_with_hint(
        &mut self,
        code: Code,
        message: impl Into<String>,
        line: u32,
        column: u32,
        hint: impl Into<String>,
    ) {
        self.emit(
            Level::Error,
            code,
            message.into(),
            line,
            column,
            Some(hint.into()),
        );
    }

    pub fn warning(&mut self, code: Code, message: impl Into<String>, line: u32, column: u32) {
        self.emit(Level::Warning, code, message.into(), line, column, None);
    }

    pub fn warning_with_hint(
        &mut self,
        code: Code,
        message: impl Into<String>,
        line: u32,
        column: u32,
        hint: impl Into<String>,
    ) {
        self.emit(
            Level::Warning,
            code,
            message.into(),
            line,
            column,
            Some(hint.into()),
        );
    }

    fn emit(
        &mut self,
        level: Level,
        code: Code,
        message: String,
        line: u32,
        column: u32,
        hint: Option<String>,
    ) {
        match level {
            Level::Error => {
                self.errors += 1;
                tracing::error!(
                    "{}:{}:{}: error {}: {}",
                    self.file.display(),
                    line,
                    column,
                    code,
                    message
                );
            }
            Level::Warning => {
                self.warnings += 1;
                tracing::warn!(
                    "{}:{}:{}: warning {}: {}",
                    self.file.display(),
                    line,
                    column,
                    code,
                    message
                );
            }
            _ => {}
        }
        self.records.push(Diagnostic {
            level,
            code,
            message,
            line,
            column,
            hint,
        });
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render all records, one per line, in emission order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for d in &self.records {
            out.push_str(&format!(
                "{}:{}:{}: {} {}: {}\n",
                self.file.display(),
                d.line,
                d.column,
                d.level,
                d.code,
                d.message
            ));
            if let Some(hint) = &d.hint {
                out.push_str(&format!("  hint: {}\n", hint));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Code::InvalidCharacter.as_str(), "E001");
        assert_eq!(Code::UnterminatedString.as_str(), "E002");
        assert_eq!(Code::InterfaceViolation.as_str(), "E015");
        assert_eq!(Code::UnusedSymbol.as_str(), "W001");
    }

    #[test]
    fn test_counts_and_order() {
        let mut diags = Diagnostics::new("test.mf");
        diags.warning(Code::UnusedSymbol, "symbol `x` is never used", 3, 5);
        diags.error(Code::UndefinedVariable, "undefined variable `y`", 4, 1);
        assert_eq!(diags.error_count(), 1);
        assert_eq!(diags.warning_count(), 1);
        assert!(diags.has_errors());

        let rendered = diags.render();
        let warn_pos = rendered.find("W001").unwrap();
        let err_pos = rendered.find("E008").unwrap();
        assert!(warn_pos < err_pos, "emission order must be preserved");
    }

    #[test]
    fn test_hint_rendering() {
        let mut diags = Diagnostics::new("test.mf");
        diags.warning_with_hint(
            Code::UnusedSymbol,
            "symbol `tmp` is never used",
            1,
            1,
            "remove it or mark it exported",
        );
        assert!(diags.render().contains("hint: remove it"));
    }
}
