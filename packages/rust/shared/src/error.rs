//! Error types for CodeKB.
//!
//! Library crates use [`CodeKbError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all CodeKB operations.
#[derive(Debug, thiserror::Error)]
pub enum CodeKbError {
    /// Admission denied: the concurrency ceiling is reached.
    #[error("pipeline capacity exceeded: {limit} runs already active")]
    CapacityExceeded { limit: usize },

    /// Operation on an unknown pipeline run.
    #[error("pipeline run not found: {run_id}")]
    NotFound { run_id: String },

    /// Out-of-range or malformed argument (e.g. a step ordinal).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A step executor raised an error.
    #[error("{step} step failed ({action}): {message}")]
    StepExecution {
        step: String,
        action: String,
        message: String,
    },

    /// Best-effort cleanup failed. Logged, never surfaced to callers.
    #[error("rollback of {path:?} failed: {message}")]
    Rollback { path: PathBuf, message: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// JSON encoding/decoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// HTTP server error (bind, serve).
    #[error("server error: {0}")]
    Server(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CodeKbError>;

impl CodeKbError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a not-found error for a run id (or its raw string form).
    pub fn not_found(run_id: impl ToString) -> Self {
        Self::NotFound {
            run_id: run_id.to_string(),
        }
    }

    /// Create an invalid-argument error from any displayable message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
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

    /// Whether this error is a caller mistake rather than a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::InvalidArgument { .. })
    }
}

impl From<serde_json::Error> for CodeKbError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CodeKbError::CapacityExceeded { limit: 3 };
        assert_eq!(
            err.to_string(),
            "pipeline capacity exceeded: 3 runs already active"
        );

        let err = CodeKbError::StepExecution {
            step: "dependency-analysis".into(),
            action: "analyze dependencies".into(),
            message: "timeout".into(),
        };
        let text = err.to_string();
        assert!(text.contains("dependencies"));
        assert!(text.contains("timeout"));
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(CodeKbError::not_found("abc").is_client_error());
        assert!(CodeKbError::invalid_argument("step 9").is_client_error());
        assert!(!CodeKbError::CapacityExceeded { limit: 1 }.is_client_error());
    }
}
