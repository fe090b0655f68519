//! The diagnostic sink.
//!
//! A flat accumulating list of errors and warnings, shared by every phase.
//! Phases never abort on the first error — they record it and keep going so
//! a single run surfaces as much as possible — but the driver gates between
//! phases on [`Sink::has_errors`].

use std::fmt;

/// Which phase produced a diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Lexer,
    Parser,
    Semantic,
    Codegen,
    System,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Lexer => "lexer",
            Category::Parser => "parser",
            Category::Semantic => "semantic",
            Category::Codegen => "codegen",
            Category::System => "system",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// One recorded diagnostic.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub category: Category,
    pub level: Level,
    pub message: String,
    pub filename: Option<String>,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self.filename.as_deref().unwrap_or("<unknown>");
        write!(
            f,
            "{file}:{}:{}: {} {}: {}",
            self.line, self.column, self.category, self.level, self.message
        )
    }
}

/// Accumulates diagnostics across every phase of a compilation run.
#[derive(Default)]
pub struct Sink {
    diagnostics: Vec<Diagnostic>,
    error_count: usize,
    warning_count: usize,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        category: Category,
        level: Level,
        filename: Option<&str>,
        line: u32,
        column: u32,
        message: impl Into<String>,
    ) {
        match level {
            Level::Warning => self.warning_count += 1,
            Level::Error | Level::Fatal => self.error_count += 1,
        }
        self.diagnostics.push(Diagnostic {
            category,
            level,
            message: message.into(),
            filename: filename.map(str::to_owned),
            line,
            column,
        });
    }

    pub fn error(
        &mut self,
        category: Category,
        filename: Option<&str>,
        line: u32,
        column: u32,
        message: impl Into<String>,
    ) {
        self.push(category, Level::Error, filename, line, column, message);
    }

    pub fn fatal(&mut self, filename: Option<&str>, line: u32, column: u32, message: impl Into<String>) {
        self.push(Category::System, Level::Fatal, filename, line, column, message);
    }

    pub fn warn(
        &mut self,
        category: Category,
        filename: Option<&str>,
        line: u32,
        column: u32,
        message: impl Into<String>,
    ) {
        self.push(category, Level::Warning, filename, line, column, message);
    }

    /// True if any `Error` or `Fatal` diagnostic has been recorded.
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Print every diagnostic to stderr, in recording order.
    pub fn print_all(&self) {
        for d in &self.diagnostics {
            eprintln!("{d}");
        }
    }
}
