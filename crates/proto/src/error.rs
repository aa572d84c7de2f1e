//! Error types for the protocol crate

use miette::Diagnostic;
use thiserror::Error;

/// Error type for protocol and session failures.
///
/// `Protocol` and `Frame` errors are fatal to a session: after either, the
/// byte stream can no longer be trusted to be frame-aligned. Per-request
/// resource failures never surface here; they travel back to the peer as
/// the `Err` field of a response.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error on the session transport
    #[error("I/O {operation} failed")]
    #[diagnostic(code(sandcache::proto::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Operation that failed (e.g., "read frame", "write frame")
        operation: String,
    },

    /// A frame failed to encode or decode
    #[error("bad frame: {message}")]
    #[diagnostic(code(sandcache::proto::frame))]
    Frame {
        /// What went wrong with the frame
        message: String,
    },

    /// A frame exceeded the size cap
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    #[diagnostic(code(sandcache::proto::frame_too_large))]
    FrameTooLarge {
        /// Observed frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// The peer violated the protocol (bad build id, unknown phase,
    /// body length mismatch, ...)
    #[error("protocol violation: {message}")]
    #[diagnostic(code(sandcache::proto::violation))]
    Protocol {
        /// Description of the violation
        message: String,
    },

    /// The connection went away while requests were outstanding
    #[error("connection closed")]
    #[diagnostic(code(sandcache::proto::closed))]
    ConnectionClosed,
}

impl Error {
    /// Create an I/O error with operation context
    #[must_use]
    pub fn io(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            operation: operation.into(),
        }
    }

    /// Create a frame error
    #[must_use]
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame {
            message: msg.into(),
        }
    }

    /// Create a protocol-violation error
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, Error>;
