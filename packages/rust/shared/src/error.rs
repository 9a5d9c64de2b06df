//! Error types for Tramit.
//!
//! Library crates use [`TramitError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Tramit operations.
#[derive(Debug, thiserror::Error)]
pub enum TramitError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during fetch, liveness check, or search.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Completion service error (transport, status, or response shape).
    #[error("completion error: {0}")]
    Completion(String),

    /// Embedding service error.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Caller-facing input validation error (empty query, bad config, unknown format).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-text conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TramitError>;

impl TramitError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error belongs to the transient-network class that
    /// pipeline stages degrade on instead of aborting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Completion(_) | Self::Embedding(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = TramitError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = TramitError::validation("question must not be empty");
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn transient_classification() {
        assert!(TramitError::Network("timeout".into()).is_transient());
        assert!(TramitError::Completion("HTTP 500".into()).is_transient());
        assert!(!TramitError::validation("empty seed set").is_transient());
        assert!(!TramitError::Storage("locked".into()).is_transient());
    }
}
