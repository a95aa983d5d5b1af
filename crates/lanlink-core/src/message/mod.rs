//! Chat records handed to the history collaborator.
//!
//! The node turns every chat envelope it sends or receives into a
//! [`ChatMessage`] and appends it to a [`MessageStore`]. Storage, paging
//! and unread tracking belong to the store; the core never reads records
//! back.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Envelope, MessageKind};
use crate::transfer::Transfer;

/// What a chat message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    /// Plain text
    Text,
    /// Inline image bytes
    Image,
    /// A file offer
    File,
}

impl std::fmt::Display for ChatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "Text"),
            Self::Image => write!(f, "Image"),
            Self::File => write!(f, "File"),
        }
    }
}

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique record id
    pub id: Uuid,
    /// Remote peer id this conversation is with
    pub conversation_id: String,
    /// Sender peer id
    pub sender_id: String,
    /// Sender display name
    pub sender_name: String,
    /// Receiver peer id
    pub receiver_id: Option<String>,
    /// When the message was created by its sender
    pub timestamp: DateTime<Utc>,
    /// Message kind
    pub kind: ChatKind,
    /// Text content
    pub text: Option<String>,
    /// Image bytes
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
    /// Offered file name
    pub file_name: Option<String>,
    /// Offered file size
    pub file_size: Option<u64>,
    /// Whether the local peer sent it
    pub sent_by_me: bool,
}

impl ChatMessage {
    /// Build the record for a chat envelope, seen from `local_id`.
    ///
    /// Returns `None` for kinds that are not part of a conversation.
    pub fn from_envelope(envelope: &Envelope, local_id: &str) -> Option<Self> {
        let kind = match envelope.kind() {
            MessageKind::TextMessage => ChatKind::Text,
            MessageKind::ImageMessage => ChatKind::Image,
            MessageKind::FileTransferRequest => ChatKind::File,
            _ => return None,
        };

        let sent_by_me = envelope.sender_id() == local_id;
        let conversation_id = if sent_by_me {
            envelope.receiver_id().unwrap_or_default().to_string()
        } else {
            envelope.sender_id().to_string()
        };

        Some(Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: envelope.sender_id().to_string(),
            sender_name: envelope.sender_name().to_string(),
            receiver_id: envelope.receiver_id().map(ToString::to_string),
            timestamp: envelope.created_at(),
            kind,
            text: envelope.text().map(ToString::to_string),
            image: (kind == ChatKind::Image).then(|| envelope.data().to_vec()),
            file_name: envelope.file_name().map(ToString::to_string),
            file_size: (kind == ChatKind::File)
                .then(|| u64::try_from(envelope.file_size()).unwrap_or(0)),
            sent_by_me,
        })
    }

    /// Build the file-offer record for a transfer, seen from `local_id`.
    pub fn from_transfer(transfer: &Transfer, local_id: &str) -> Self {
        let sent_by_me = transfer.sender_id == local_id;
        Self {
            id: Uuid::new_v4(),
            conversation_id: transfer.remote_id().to_string(),
            sender_id: transfer.sender_id.clone(),
            sender_name: transfer.sender_name.clone(),
            receiver_id: Some(transfer.receiver_id.clone()),
            timestamp: transfer.started_at,
            kind: ChatKind::File,
            text: None,
            image: None,
            file_name: Some(transfer.file_name.clone()),
            file_size: Some(transfer.file_size),
            sent_by_me,
        }
    }

    /// Short human-readable summary.
    pub fn preview(&self) -> String {
        match self.kind {
            ChatKind::Text => self.text.clone().unwrap_or_default(),
            ChatKind::Image => format!(
                "[image, {} bytes]",
                self.image.as_ref().map_or(0, Vec::len)
            ),
            ChatKind::File => format!(
                "[file {} ({} bytes)]",
                self.file_name.as_deref().unwrap_or("?"),
                self.file_size.unwrap_or(0)
            ),
        }
    }
}

/// Sink for chat records.
pub trait MessageStore: Send + Sync {
    /// Record one message.
    fn append(&self, message: &ChatMessage);
}

/// Conversations kept in memory, keyed by remote peer id.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages exchanged with `peer_id`, oldest first.
    pub fn conversation(&self, peer_id: &str) -> Vec<ChatMessage> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Peer ids with at least one message.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    /// Total number of stored messages.
    pub fn len(&self) -> usize {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageStore for InMemoryStore {
    fn append(&self, message: &ChatMessage) {
        let mut conversations = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let conversation = conversations
            .entry(message.conversation_id.clone())
            .or_default();
        conversation.push(message.clone());
        conversation.sort_by_key(|m| m.timestamp);
    }
}
