//! # Error Handling
//!
//! Error types for Kura I/O operations.
//!
//! ## Propagation
//!
//! 1. **Typed**: filesystem failures are classified (`NotFound`,
//!    `PermissionDenied`, `Corrupt`) instead of surfacing raw `io::Error`s
//! 2. **Shareable**: `Error` is `Clone`, so one coalesced flush outcome can be
//!    delivered to every caller waiting on it
//! 3. **Contained**: nothing here ever aborts the host process

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for Kura operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for Kura
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("not found: {path:?}")]
    NotFound { path: PathBuf },

    #[error("permission denied: {path:?}")]
    PermissionDenied { path: PathBuf },

    #[error("corrupt read of {path:?}: expected {expected} bytes, got {actual}")]
    Corrupt {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("overloaded: {queue} queue full ({depth} waiting, {in_flight} in flight)")]
    Overloaded {
        queue: &'static str,
        depth: usize,
        in_flight: usize,
    },

    #[error("timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        source: Option<Arc<io::Error>>,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("engine is shut down")]
    Closed,
}

impl Error {
    /// Classify an I/O error raised while operating on `path`.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => Error::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => Error::Internal {
                message: format!("{}: {}", path.display(), err),
                source: Some(Arc::new(err)),
            },
        }
    }

    /// Shorthand for an `Internal` error without an I/O source.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Check if the caller may reasonably retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Overloaded { .. } => true,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
            Error::NotFound { .. } => false,
            Error::PermissionDenied { .. } => false,
            Error::Corrupt { .. } => false,
            Error::Configuration { .. } => false,
            Error::Closed => false,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::PermissionDenied { .. } => "PERMISSION_DENIED",
            Error::Corrupt { .. } => "CORRUPT",
            Error::Overloaded { .. } => "OVERLOADED",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Internal { .. } => "INTERNAL_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Closed => "CLOSED",
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Internal {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| match e {
            Error::Internal { message, source } => Error::Internal {
                message: format!("{}: {}", f(), message),
                source,
            },
            other => other,
        })
    }
}
