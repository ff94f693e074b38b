// MathVM error types
// Translation diagnostics carry source spans; runtime faults carry the bytecode offset

use colored::*;
use std::fmt;
use thiserror::Error;

/// A position in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(1, 1, 0)
    }
}

/// Start and end of a source construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn single(line: usize, column: usize, offset: usize) -> Self {
        let pos = Position::new(line, column, offset);
        Self {
            start: pos,
            end: pos,
        }
    }

    /// Span covering both `self` and `other`
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start, other.end)
    }
}

/// What went wrong while translating a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    UndefinedVariable,
    UndefinedFunction,
    DuplicateVariable,
    DuplicateFunction,
    ArityMismatch,
    TypeMismatch,
    MissingReturn,
    LimitExceeded,
    UnknownNative,
    NativeSignature,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::UndefinedVariable => "UndefinedVariable",
            ErrorKind::UndefinedFunction => "UndefinedFunction",
            ErrorKind::DuplicateVariable => "DuplicateVariable",
            ErrorKind::DuplicateFunction => "DuplicateFunction",
            ErrorKind::ArityMismatch => "ArityMismatch",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::MissingReturn => "MissingReturn",
            ErrorKind::LimitExceeded => "LimitExceeded",
            ErrorKind::UnknownNative => "UnknownNative",
            ErrorKind::NativeSignature => "NativeSignatureMismatch",
        };
        f.write_str(name)
    }
}

/// A defect in user source, detected before any code runs
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub file: String,
    pub help: Option<String>,
    source_lines: Vec<String>,
}

impl TranslationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            file: String::from("<input>"),
            help: None,
            source_lines: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_lines = source.lines().map(String::from).collect();
        self
    }

    pub fn syntax(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Syntax, message, span)
    }

    pub fn type_mismatch(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::TypeMismatch, message, span)
    }

    pub fn limit(what: &str, span: Span) -> Self {
        Self::new(
            ErrorKind::LimitExceeded,
            format!("Too many {} (limit is {})", what, u16::MAX),
            span,
        )
    }

    /// Colored report with the offending line and a caret underneath
    pub fn format(&self) -> String {
        let mut output = format!(
            "{}: {} at {}:{}:{}\n",
            self.kind.to_string().red().bold(),
            self.message.white().bold(),
            self.file,
            self.span.start.line,
            self.span.start.column
        );

        let line = self.span.start.line;
        if line >= 1 && line <= self.source_lines.len() {
            let first = line.saturating_sub(1).max(1);
            let last = (line + 1).min(self.source_lines.len());
            output.push('\n');
            for n in first..=last {
                let gutter = format!("{:>4} |", n);
                let content = &self.source_lines[n - 1];
                if n == line {
                    output.push_str(&format!("{} {}\n", gutter.red(), content));
                    let width = if self.span.end.line == line
                        && self.span.end.column > self.span.start.column
                    {
                        self.span.end.column - self.span.start.column
                    } else {
                        1
                    };
                    let pad = " ".repeat(6 + self.span.start.column);
                    output.push_str(&format!("{}{}\n", pad, "^".repeat(width).red().bold()));
                } else {
                    output.push_str(&format!("{} {}\n", gutter.dimmed(), content));
                }
            }
        }

        if let Some(help) = &self.help {
            output.push_str(&format!("\n      {}: {}\n", "Help".cyan().bold(), help));
        }
        output
    }
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} at {}:{}:{}",
            self.kind, self.message, self.file, self.span.start.line, self.span.start.column
        )
    }
}

impl std::error::Error for TranslationError {}

/// A fault raised while executing bytecode
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("RuntimeError: {message} in '{function}' at offset {offset}")]
pub struct RuntimeError {
    pub message: String,
    pub function: String,
    pub function_id: u16,
    pub offset: usize,
}

impl RuntimeError {
    pub fn new(
        message: impl Into<String>,
        function: impl Into<String>,
        function_id: u16,
        offset: usize,
    ) -> Self {
        Self {
            message: message.into(),
            function: function.into(),
            function_id,
            offset,
        }
    }
}

/// Broken translator or corrupt code object; never caused by a user program
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("label used but never bound in function '{0}'")]
    UnboundLabel(String),
    #[error("constant id {0} is out of range")]
    ConstantOutOfRange(u16),
    #[error("function table is inconsistent: {0}")]
    CorruptFunctionTable(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("internal error: {0}")]
    Internal(#[from] InternalError),
    #[error("{0} not found")]
    NotFound(String),
}

impl Error {
    /// Report for terminal output; translation errors get source context
    pub fn report(&self) -> String {
        match self {
            Error::Translation(e) => e.format(),
            Error::Runtime(e) => format!(
                "{}: {} in '{}' at offset {}\n",
                "RuntimeError".red().bold(),
                e.message.white().bold(),
                e.function,
                e.offset
            ),
            other => format!("{}\n", other.to_string().red().bold()),
        }
    }
}

pub type MvmResult<T> = Result<T, Error>;
