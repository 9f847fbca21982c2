// File: src/errors.rs
//
// Error handling and reporting for the Ardan execution engine.
// Provides structured error types with source location information
// and pretty-printed error messages.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

#[allow(dead_code)]
impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column, file: None }
    }

    pub fn with_file(line: usize, column: usize, file: String) -> Self {
        Self { line, column, file: Some(file) }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0, file: None }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:{}:{}", file, self.line, self.column)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Types of errors that can occur while compiling or running Ardan code
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    ParseError,
    CompileError,
    RuntimeError,
    TypeError,
    UndefinedVariable,
    ConstAssignment,
    VisibilityError,
    BadFile,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ParseError => write!(f, "Parse Error"),
            ErrorKind::CompileError => write!(f, "Compile Error"),
            ErrorKind::RuntimeError => write!(f, "Runtime Error"),
            ErrorKind::TypeError => write!(f, "Type Error"),
            ErrorKind::UndefinedVariable => write!(f, "Undefined Variable"),
            ErrorKind::ConstAssignment => write!(f, "Const Assignment"),
            ErrorKind::VisibilityError => write!(f, "Visibility Error"),
            ErrorKind::BadFile => write!(f, "Bad File"),
        }
    }
}

/// A structured error with location information
#[derive(Debug, Clone)]
pub struct ArdanError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub source_line: Option<String>,
    pub help: Option<String>,
}

#[allow(dead_code)]
impl ArdanError {
    pub fn new(kind: ErrorKind, message: String, location: SourceLocation) -> Self {
        Self { kind, message, location, source_line: None, help: None }
    }

    pub fn with_source(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    /// Create a parse error
    pub fn parse_error(message: String, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ParseError, message, location)
    }

    /// Create a compile error
    pub fn compile_error(message: String) -> Self {
        Self::new(ErrorKind::CompileError, message, SourceLocation::unknown())
    }

    /// Create a runtime error
    pub fn runtime_error(message: String) -> Self {
        Self::new(ErrorKind::RuntimeError, message, SourceLocation::unknown())
    }

    /// Create an undefined variable error
    pub fn undefined_variable(name: &str) -> Self {
        Self::new(
            ErrorKind::UndefinedVariable,
            format!("Variable '{}' is not defined", name),
            SourceLocation::unknown(),
        )
    }

    /// Create a malformed-file error for the module codec
    pub fn bad_file(message: String) -> Self {
        Self::new(ErrorKind::BadFile, message, SourceLocation::unknown())
    }
}

impl fmt::Display for ArdanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Error header with kind and message
        let kind_str = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        // Location arrow
        if self.location != SourceLocation::unknown() {
            let location_str = format!("  --> {}", self.location);
            writeln!(f, "{}", location_str.bright_blue())?;
        }

        // Source code context
        if let Some(ref source) = self.source_line {
            let line_num = self.location.line;
            let col_num = self.location.column;

            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(
                f,
                "{} {} {}",
                format!("{:3}", line_num).bright_blue(),
                "|".bright_blue(),
                source
            )?;
            writeln!(
                f,
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(col_num.saturating_sub(1)),
                "^".red().bold()
            )?;
        }

        if let Some(ref help) = self.help {
            writeln!(f, "   {} {}", "=".bright_yellow(), format!("help: {}", help).bright_yellow())?;
        }

        Ok(())
    }
}

impl std::error::Error for ArdanError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_formats_with_and_without_file() {
        let bare = SourceLocation::new(3, 7);
        assert_eq!(format!("{}", bare), "3:7");
        let with_file = SourceLocation::with_file(3, 7, "main.ardan".to_string());
        assert_eq!(format!("{}", with_file), "main.ardan:3:7");
    }

    #[test]
    fn error_message_carries_kind() {
        let err = ArdanError::undefined_variable("missing");
        assert_eq!(err.kind, ErrorKind::UndefinedVariable);
        assert!(err.message.contains("missing"));
    }
}
