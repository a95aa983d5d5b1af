//! The envelope: one binary message type shared by every channel.
//!
//! Fields are declared in wire order and must never be reordered:
//!
//! | # | Field          | Type            |
//! |---|----------------|-----------------|
//! | 0 | kind           | [`MessageKind`] |
//! | 1 | sender_id      | string          |
//! | 2 | sender_name    | string          |
//! | 3 | receiver_id    | optional string |
//! | 4 | timestamp      | i64 (Unix ms)   |
//! | 5 | data           | bytes           |
//! | 6 | text           | optional string |
//! | 7 | file_name      | optional string |
//! | 8 | file_size      | i64             |
//! | 9 | file_id        | optional string |
//! | 10| chunk_index    | i32             |
//! | 11| total_chunks   | i32             |
//!
//! Encoding is bincode with variable-length integers, so a 64 KiB chunk costs
//! well under 200 bytes of overhead.

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LocalIdentity;
use crate::error::{Error, Result, ValidationError};

/// Upper bound on bytes bincode may consume while decoding one envelope.
const DECODE_LIMIT: u64 = 64 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(DECODE_LIMIT)
}

/// Envelope kinds. The discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Presence probe, broadcast periodically
    Discovery = 0,
    /// Unicast answer to a probe
    DiscoveryResponse = 1,
    /// Presence announcement
    UserJoined = 2,
    /// Graceful departure
    UserLeft = 3,
    /// Chat text
    TextMessage = 4,
    /// Chat image
    ImageMessage = 5,
    /// Offer to send a file
    FileTransferRequest = 6,
    /// Receiver accepts an offer
    FileTransferAccept = 7,
    /// Receiver declines an offer
    FileTransferReject = 8,
    /// One chunk of file content
    FileTransferData = 9,
    /// All chunks were sent
    FileTransferComplete = 10,
    /// The sender is typing
    TypingNotification = 11,
    /// Keep-alive
    Heartbeat = 12,
}

impl MessageKind {
    /// Parse a kind from its wire value.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Discovery),
            1 => Some(Self::DiscoveryResponse),
            2 => Some(Self::UserJoined),
            3 => Some(Self::UserLeft),
            4 => Some(Self::TextMessage),
            5 => Some(Self::ImageMessage),
            6 => Some(Self::FileTransferRequest),
            7 => Some(Self::FileTransferAccept),
            8 => Some(Self::FileTransferReject),
            9 => Some(Self::FileTransferData),
            10 => Some(Self::FileTransferComplete),
            11 => Some(Self::TypingNotification),
            12 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    /// Whether this kind belongs to the presence protocol.
    pub const fn is_discovery(self) -> bool {
        matches!(
            self,
            Self::Discovery | Self::DiscoveryResponse | Self::UserJoined | Self::UserLeft
        )
    }

    /// Whether this kind belongs to the file transfer protocol.
    pub const fn is_file_transfer(self) -> bool {
        matches!(
            self,
            Self::FileTransferRequest
                | Self::FileTransferAccept
                | Self::FileTransferReject
                | Self::FileTransferData
                | Self::FileTransferComplete
        )
    }
}

/// A wire message.
///
/// Envelopes are built by value with the `with_*` methods right before they
/// are sent and are read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    kind: MessageKind,
    sender_id: String,
    sender_name: String,
    receiver_id: Option<String>,
    timestamp: i64,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    text: Option<String>,
    file_name: Option<String>,
    file_size: i64,
    file_id: Option<String>,
    chunk_index: i32,
    total_chunks: i32,
}

impl Envelope {
    /// Create an envelope of the given kind, stamped with the current time.
    #[must_use]
    pub fn new(
        kind: MessageKind,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            receiver_id: None,
            timestamp: Utc::now().timestamp_millis(),
            data: Vec::new(),
            text: None,
            file_name: None,
            file_size: 0,
            file_id: None,
            chunk_index: 0,
            total_chunks: 0,
        }
    }

    /// Create an envelope sent by the local peer.
    #[must_use]
    pub fn from_identity(kind: MessageKind, identity: &LocalIdentity) -> Self {
        Self::new(kind, identity.id.clone(), identity.name.clone())
    }

    /// Presence probe announcing the transport port.
    #[must_use]
    pub fn discovery(identity: &LocalIdentity, transport_port: u16) -> Self {
        Self::from_identity(MessageKind::Discovery, identity).with_text(transport_port.to_string())
    }

    /// Answer to a presence probe, announcing the transport port.
    #[must_use]
    pub fn discovery_response(identity: &LocalIdentity, transport_port: u16) -> Self {
        Self::from_identity(MessageKind::DiscoveryResponse, identity)
            .with_text(transport_port.to_string())
    }

    /// Departure notice.
    #[must_use]
    pub fn user_left(identity: &LocalIdentity) -> Self {
        Self::from_identity(MessageKind::UserLeft, identity)
    }

    /// Chat text addressed to `receiver_id`.
    #[must_use]
    pub fn text_message(
        identity: &LocalIdentity,
        receiver_id: &str,
        text: impl Into<String>,
    ) -> Self {
        Self::from_identity(MessageKind::TextMessage, identity)
            .with_receiver(receiver_id)
            .with_text(text)
    }

    /// Chat image addressed to `receiver_id`.
    #[must_use]
    pub fn image_message(identity: &LocalIdentity, receiver_id: &str, image: Vec<u8>) -> Self {
        Self::from_identity(MessageKind::ImageMessage, identity)
            .with_receiver(receiver_id)
            .with_data(image)
    }

    /// Set the receiver id.
    #[must_use]
    pub fn with_receiver(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = Some(receiver_id.into());
        self
    }

    /// Set the text payload.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set the byte payload.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Set the file name and size.
    #[must_use]
    pub fn with_file(mut self, file_name: impl Into<String>, file_size: i64) -> Self {
        self.file_name = Some(file_name.into());
        self.file_size = file_size;
        self
    }

    /// Set the file id.
    #[must_use]
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    /// Set the chunk position.
    #[must_use]
    pub fn with_chunk(mut self, chunk_index: i32, total_chunks: i32) -> Self {
        self.chunk_index = chunk_index;
        self.total_chunks = total_chunks;
        self
    }

    /// Override the creation timestamp (Unix milliseconds).
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_millis: i64) -> Self {
        self.timestamp = timestamp_millis;
        self
    }

    /// Envelope kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Sender peer id.
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Sender display name.
    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    /// Receiver peer id, if addressed.
    pub fn receiver_id(&self) -> Option<&str> {
        self.receiver_id.as_deref()
    }

    /// Creation time in Unix milliseconds.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default()
    }

    /// Byte payload (image bytes or chunk bytes).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the byte payload.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Text payload.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// File name.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// File size in bytes.
    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    /// File id.
    pub fn file_id(&self) -> Option<&str> {
        self.file_id.as_deref()
    }

    /// Zero-based chunk index.
    pub fn chunk_index(&self) -> i32 {
        self.chunk_index
    }

    /// Total number of chunks in the file.
    pub fn total_chunks(&self) -> i32 {
        self.total_chunks
    }

    /// Transport port announced in a presence message.
    pub fn announced_port(&self) -> Option<u16> {
        self.text.as_deref().and_then(|t| t.trim().parse().ok())
    }

    /// Check the envelope against the rules for its kind.
    ///
    /// # Errors
    ///
    /// Returns the first rule that fails.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.sender_id.trim().is_empty() {
            return Err(ValidationError::MissingSenderId);
        }
        if self.sender_name.trim().is_empty() {
            return Err(ValidationError::MissingSenderName);
        }

        let blank = |value: &Option<String>| value.as_deref().map_or(true, str::is_empty);

        match self.kind {
            MessageKind::TextMessage => {
                if blank(&self.text) {
                    return Err(ValidationError::MissingText);
                }
            }
            MessageKind::ImageMessage => {
                if self.data.is_empty() {
                    return Err(ValidationError::MissingImageData);
                }
            }
            MessageKind::FileTransferRequest => {
                if blank(&self.file_name) {
                    return Err(ValidationError::MissingFileName);
                }
                if self.file_size <= 0 {
                    return Err(ValidationError::InvalidFileSize(self.file_size));
                }
                if blank(&self.file_id) {
                    return Err(ValidationError::MissingFileId);
                }
            }
            MessageKind::FileTransferData => {
                if self.data.is_empty() {
                    return Err(ValidationError::MissingChunkData);
                }
                if blank(&self.file_id) {
                    return Err(ValidationError::MissingFileId);
                }
                if self.chunk_index < 0 {
                    return Err(ValidationError::NegativeChunkIndex(self.chunk_index));
                }
                if self.total_chunks <= 0 {
                    return Err(ValidationError::InvalidTotalChunks(self.total_chunks));
                }
            }
            MessageKind::Discovery
            | MessageKind::DiscoveryResponse
            | MessageKind::UserJoined
            | MessageKind::UserLeft
            | MessageKind::FileTransferAccept
            | MessageKind::FileTransferReject
            | MessageKind::FileTransferComplete
            | MessageKind::TypingNotification
            | MessageKind::Heartbeat => {}
        }

        Ok(())
    }
}

/// Validate and encode an envelope.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the envelope breaks a rule, or
/// [`Error::Serialization`] if encoding fails.
pub fn serialize(envelope: &Envelope) -> Result<Vec<u8>> {
    envelope.validate()?;
    codec()
        .serialize(envelope)
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode and validate an envelope.
///
/// # Errors
///
/// Returns [`Error::EmptyData`] for empty input, [`Error::Serialization`] if
/// the bytes do not decode, or [`Error::Validation`] if the decoded envelope
/// breaks a rule.
pub fn deserialize(bytes: &[u8]) -> Result<Envelope> {
    if bytes.is_empty() {
        return Err(Error::EmptyData);
    }
    let envelope: Envelope = codec()
        .deserialize(bytes)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    envelope.validate()?;
    Ok(envelope)
}
