//! Error types for Lanlink.
//!
//! This module provides a unified error type for all Lanlink operations,
//! with specific error variants for different failure modes. Envelope
//! validation failures carry their own [`ValidationError`] so callers can
//! tell exactly which rule an envelope broke.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A specialized `Result` type for Lanlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A semantic rule broken by an envelope.
///
/// Rules are checked in declaration order; the first failure wins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Sender id is missing or blank
    #[error("sender id is required")]
    MissingSenderId,

    /// Sender display name is missing or blank
    #[error("sender name is required")]
    MissingSenderName,

    /// Text message without text
    #[error("text message requires text content")]
    MissingText,

    /// Image message without image bytes
    #[error("image message requires image data")]
    MissingImageData,

    /// File transfer request without a file name
    #[error("file transfer request requires a file name")]
    MissingFileName,

    /// File transfer request with a non-positive size
    #[error("file size must be positive, got {0}")]
    InvalidFileSize(i64),

    /// File transfer message without a file id
    #[error("file transfer message requires a file id")]
    MissingFileId,

    /// File chunk without payload
    #[error("file chunk requires data")]
    MissingChunkData,

    /// File chunk with a negative index
    #[error("chunk index must not be negative, got {0}")]
    NegativeChunkIndex(i32),

    /// File chunk with a non-positive chunk count
    #[error("total chunk count must be positive, got {0}")]
    InvalidTotalChunks(i32),
}

/// The main error type for Lanlink.
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope failed semantic validation and was not transmitted
    #[error("invalid envelope: {0}")]
    Validation(#[from] ValidationError),

    /// Nothing to decode
    #[error("cannot deserialize empty data")]
    EmptyData,

    /// Encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stream framing violated the protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Message larger than the configured frame limit
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Size of the offending message
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Connecting to a peer did not finish in time
    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    /// Operation requires a running service
    #[error("service is not running")]
    ServiceNotRunning,

    /// Unable to broadcast on network
    #[error("unable to broadcast on network: {0}")]
    BroadcastFailed(String),

    /// Peer is not in the peer table
    #[error("peer '{0}' not found")]
    PeerNotFound(String),

    /// No active transfer with this file id
    #[error("no active transfer with id '{0}'")]
    TransferNotFound(String),

    /// Transfer is not in a state that allows the operation
    #[error("transfer '{file_id}' is {state}, cannot {action}")]
    InvalidTransferState {
        /// Transfer file id
        file_id: String,
        /// Current state
        state: String,
        /// Attempted action
        action: &'static str,
    },

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// Transfer failed mid-stream
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns whether this error is transient and the operation may be retried.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectTimeout(_) | Self::BroadcastFailed(_)
        )
    }

    /// Returns whether this error tears down the connection it occurred on.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::MessageTooLarge { .. })
    }

    /// Returns whether this error came from envelope validation.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_converts() {
        let err: Error = ValidationError::MissingSenderId.into();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "invalid envelope: sender id is required");
    }

    #[test]
    fn test_classification() {
        let io = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_recoverable());
        assert!(!io.is_protocol_violation());

        let too_large = Error::MessageTooLarge { size: 10, max: 5 };
        assert!(too_large.is_protocol_violation());
        assert!(!too_large.is_recoverable());

        assert!(!Error::EmptyData.is_validation());
    }
}
