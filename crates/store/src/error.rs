//! Error types for the store crate

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during a store operation
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(sandcache::store::io),
        help("Check permissions on the cache directory and that it exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// A body ended before (or after) its declared size
    #[error("wrote {wrote} bytes, expected {expected}")]
    #[diagnostic(code(sandcache::store::size_mismatch))]
    SizeMismatch {
        /// Bytes actually copied to disk
        wrote: u64,
        /// Bytes the caller declared
        expected: u64,
    },

    /// Serialization error
    #[error("serialization error: {message}")]
    #[diagnostic(code(sandcache::store::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;
