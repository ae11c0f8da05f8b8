//! Error types and result definitions for Droplet.
//!
//! Every phase of the pipeline reports through a single error enum:
//! - Lexical errors (tokenization failures)
//! - Syntax errors (parsing failures)
//! - Type errors (semantic analysis failures)
//! - Compile errors (bytecode generation failures)
//! - Load errors (malformed DLBC artifacts)
//! - Module errors (import resolution failures)

use crate::location::SourceLocation;
use thiserror::Error;

/// The unified result type used throughout Droplet.
pub type DropletResult<T> = Result<T, DropletError>;

/// Comprehensive error type covering every Droplet failure condition.
#[derive(Error, Debug, Clone)]
pub enum DropletError {
    /// Lexical analysis error.
    #[error("lex error at {location}: {message}")]
    Lex {
        /// Error description.
        message: String,
        /// Source location.
        location: SourceLocation,
    },

    /// Syntax/parsing error.
    #[error("parse error at {location}: {message}")]
    Syntax {
        /// Error description.
        message: String,
        /// Source location.
        location: SourceLocation,
    },

    /// Type or semantic error.
    #[error("type error: {message}")]
    Type {
        /// Error description.
        message: String,
    },

    /// Bytecode generation error.
    #[error("compile error: {message}")]
    Compile {
        /// Error description.
        message: String,
    },

    /// DLBC loading/validation error.
    #[error("load error: {message}")]
    Load {
        /// Error description.
        message: String,
    },

    /// Module resolution or import error.
    #[error("module error: {message}")]
    Module {
        /// Error description.
        message: String,
    },

    /// Underlying I/O failure (file reads/writes).
    #[error("io error: {message}")]
    Io {
        /// Error description.
        message: String,
    },
}

impl DropletError {
    /// Create a lex error with location.
    #[must_use]
    pub fn lex(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::Lex {
            message: message.into(),
            location,
        }
    }

    /// Create a syntax error with location.
    #[must_use]
    pub fn syntax(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::Syntax {
            message: message.into(),
            location,
        }
    }

    /// Create a type error.
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Create a compile error.
    #[must_use]
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile {
            message: message.into(),
        }
    }

    /// Create a load error.
    #[must_use]
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    /// Create a module error.
    #[must_use]
    pub fn module(message: impl Into<String>) -> Self {
        Self::Module {
            message: message.into(),
        }
    }

    /// The source location attached to this error, if any.
    #[must_use]
    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            Self::Lex { location, .. } | Self::Syntax { location, .. } => Some(*location),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DropletError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lex_error_display() {
        let err = DropletError::lex("unknown annotation '@wat'", SourceLocation::new(4, 9));
        assert_eq!(err.to_string(), "lex error at 4:9: unknown annotation '@wat'");
        assert_eq!(err.location(), Some(SourceLocation::new(4, 9)));
    }

    #[test]
    fn test_syntax_error_display() {
        let err = DropletError::syntax("expected ')'", SourceLocation::new(1, 20));
        assert_eq!(err.to_string(), "parse error at 1:20: expected ')'");
    }

    #[test]
    fn test_type_error_has_no_location() {
        let err = DropletError::type_error("mismatch");
        assert!(err.location().is_none());
        assert_eq!(err.to_string(), "type error: mismatch");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DropletError = io.into();
        assert!(matches!(err, DropletError::Io { .. }));
    }

    #[test]
    fn test_error_is_clone() {
        let err = DropletError::load("bad magic");
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
