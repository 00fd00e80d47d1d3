//! Error types for Meridian Core

use thiserror::Error;

/// Result type alias using Meridian Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from sockets and temp files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// Storage-related errors (corrupt rows, missing tables)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encoding/decoding of stored rows or JSON envelopes
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed frames, unknown item types, bad lengths
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream in the middle of a read
    #[error("Unexpected end of stream while reading {0}")]
    EndOfStream(String),

    /// A replicated document references an attachment that is not stored locally
    #[error("Missing attachment: {0}")]
    MissingAttachment(String),

    /// Conflict-resolution invariant violated; indicates a resolver bug
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Transaction merger errors (queue closed, command panicked)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The operation was aborted because the session or database is shutting down
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an end-of-stream error
    pub fn end_of_stream(what: impl Into<String>) -> Self {
        Self::EndOfStream(what.into())
    }

    /// Create a missing attachment error
    pub fn missing_attachment(msg: impl Into<String>) -> Self {
        Self::MissingAttachment(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for the recoverable missing-attachment condition
    pub fn is_missing_attachment(&self) -> bool {
        matches!(self, Self::MissingAttachment(_))
    }

    /// True when the error only reflects a shutdown in progress
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// True for stream faults that leave the connection unusable
    pub fn is_stream_fault(&self) -> bool {
        matches!(self, Self::Io(_) | Self::EndOfStream(_) | Self::Protocol(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::Protocol(format!("Invalid UTF-8: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::missing_attachment("doc/1").is_missing_attachment());
        assert!(Error::cancelled("shutdown").is_cancellation());
        assert!(Error::end_of_stream("item type").is_stream_fault());
        assert!(!Error::invariant("bad").is_stream_fault());
    }

    #[test]
    fn test_display() {
        let err = Error::protocol("Unknown item type: 42");
        assert_eq!(err.to_string(), "Protocol error: Unknown item type: 42");
    }
}
