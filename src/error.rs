//! Error types for meshwire.
//!
//! Only transport, framing and configuration problems are reported through
//! [`WireError`]. Failures of an individual call are carried back to the
//! caller inside a response (see [`ErrorCode`](crate::protocol::ErrorCode)).

use thiserror::Error;

/// Main error type for all meshwire operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (unknown command, malformed header, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Declared frame body length is larger than the configured bound.
    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },

    /// Snappy block could not be decompressed. The stream is desynchronized.
    #[error("Decompress error: {0}")]
    Decompress(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Client-side wait for a response exceeded its budget.
    #[error("Request timed out")]
    Timeout,

    /// Invalid or incomplete configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A collaborator (service registry) refused an operation.
    #[error("Registry error: {0}")]
    Registry(String),
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
