//! JSON WebSocket protocol.
//!
//! Every message is an object with a `type` discriminator; document-scoped
//! messages carry a `documentId` so one connection can multiplex several
//! documents. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::presence::PresenceState;
use super::{DocumentId, ParticipantId, SyncError};

/// Protocol version reported by the health endpoint
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum accepted frame size (4MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not attached to document {0}")]
    NotAttached(DocumentId),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join { document_id: DocumentId },
    Leave { document_id: DocumentId },
    Edit { document_id: DocumentId, content: String },
    Undo { document_id: DocumentId },
    Redo { document_id: DocumentId },
    TypingStart { document_id: DocumentId },
    TypingStop { document_id: DocumentId },
    LockAcquire { document_id: DocumentId },
    LockRelease { document_id: DocumentId },
    /// Keep-alive, valid in any state
    Ping { timestamp: u64 },
}

impl ClientMessage {
    /// Document the message targets, if any
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Join { document_id }
            | ClientMessage::Leave { document_id }
            | ClientMessage::Edit { document_id, .. }
            | ClientMessage::Undo { document_id }
            | ClientMessage::Redo { document_id }
            | ClientMessage::TypingStart { document_id }
            | ClientMessage::TypingStop { document_id }
            | ClientMessage::LockAcquire { document_id }
            | ClientMessage::LockRelease { document_id } => Some(document_id),
            ClientMessage::Ping { .. } => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::Edit { .. } => "edit",
            ClientMessage::Undo { .. } => "undo",
            ClientMessage::Redo { .. } => "redo",
            ClientMessage::TypingStart { .. } => "typing_start",
            ClientMessage::TypingStop { .. } => "typing_stop",
            ClientMessage::LockAcquire { .. } => "lock_acquire",
            ClientMessage::LockRelease { .. } => "lock_release",
            ClientMessage::Ping { .. } => "ping",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Reply to a successful join
    Joined {
        document_id: DocumentId,
        /// Participants in join order, including the joiner
        roster: Vec<PresenceState>,
        lock_holder: Option<ParticipantId>,
        current_content: String,
        /// History position of `current_content`, absent before the first edit
        index: Option<usize>,
    },

    /// Confirmation of an explicit leave
    Left { document_id: DocumentId },

    ParticipantJoined {
        document_id: DocumentId,
        participant_id: ParticipantId,
    },

    ParticipantLeft {
        document_id: DocumentId,
        participant_id: ParticipantId,
    },

    DocumentUpdated {
        document_id: DocumentId,
        content: String,
        author_id: ParticipantId,
        index: usize,
    },

    TypingChanged {
        document_id: DocumentId,
        participant_id: ParticipantId,
        is_typing: bool,
    },

    LockGranted {
        document_id: DocumentId,
        holder: ParticipantId,
        expires_at: DateTime<Utc>,
    },

    /// "Someone else is editing"
    LockDenied {
        document_id: DocumentId,
        reason: String,
        holder: ParticipantId,
    },

    LockReleased {
        document_id: DocumentId,
        holder: ParticipantId,
        reason: LockReleaseReason,
    },

    Error {
        code: ErrorCode,
        message: String,
        document_id: Option<DocumentId>,
    },

    Pong { timestamp: u64, server_time: i64 },
}

/// Why a lock went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReleaseReason {
    Released,
    Expired,
    HolderLeft,
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    LockRequired,
    LockHeld,
    NotHolder,
    NoHistory,
    NoFuture,
    ProtocolError,
    SessionEvicted,
    StorageUnavailable,
    DocumentFull,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    #[cfg(test)]
    pub fn encode_client(msg: &ClientMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    pub fn encode_server(msg: &ServerMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Decode a client message from a text frame
    pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
        Self::decode_client_bytes(text.as_bytes())
    }

    /// Decode a client message from a binary frame holding UTF-8 JSON
    pub fn decode_client_bytes(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
        }
        serde_json::from_slice(data).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
    }

    #[cfg(test)]
    pub fn decode_server(text: &str) -> Result<ServerMessage, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Create an error response message
    pub fn error_response(err: &SyncError, document_id: Option<&str>) -> ServerMessage {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
            document_id: document_id.map(str::to_string),
        }
    }
}
