//! Synchronization module for lock-serialized collaborative editing.
//!
//! Write access to a document is serialized by a single-writer lock instead of
//! merged after the fact. It provides:
//! - A linear undo/redo history with branch discard
//! - Per-document edit locks with TTL reclamation
//! - Presence and typing indicators
//! - The message router that ties them together per document session

pub mod history;
pub mod lock;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

pub use server::{SyncServer, SyncServerConfig};

use thiserror::Error;

use self::history::HistoryError;
use self::lock::LockError;
use self::presence::PresenceError;
use self::protocol::{ErrorCode, ProtocolError};
use crate::storage::StorageError;

/// Identifier of a document, owned by the storage collaborator
pub type DocumentId = String;

/// Verified identity of a participant, supplied by the auth layer
pub type ParticipantId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced to the connection that caused them
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Edit lock required for document {0}")]
    LockRequired(DocumentId),

    #[error("Someone else is editing: lock held by {holder}")]
    LockHeld { holder: ParticipantId },

    #[error("Lock is not held by {0}")]
    NotHolder(ParticipantId),

    #[error("Nothing to undo")]
    NoHistory,

    #[error("Nothing to redo")]
    NoFuture,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session for document {0} was evicted and could not be reloaded")]
    SessionEvicted(DocumentId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Document {0} has reached its participant limit")]
    DocumentFull(DocumentId),
}

impl SyncError {
    /// Stable wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::LockRequired(_) => ErrorCode::LockRequired,
            SyncError::LockHeld { .. } => ErrorCode::LockHeld,
            SyncError::NotHolder(_) => ErrorCode::NotHolder,
            SyncError::NoHistory => ErrorCode::NoHistory,
            SyncError::NoFuture => ErrorCode::NoFuture,
            SyncError::Protocol(_) => ErrorCode::ProtocolError,
            SyncError::SessionEvicted(_) => ErrorCode::SessionEvicted,
            SyncError::Storage(_) => ErrorCode::StorageUnavailable,
            SyncError::DocumentFull(_) => ErrorCode::DocumentFull,
        }
    }
}

impl From<HistoryError> for SyncError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::NoHistory => SyncError::NoHistory,
            HistoryError::NoFuture => SyncError::NoFuture,
        }
    }
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { holder } => SyncError::LockHeld { holder },
            LockError::NotHolder(participant) => SyncError::NotHolder(participant),
        }
    }
}

impl From<PresenceError> for SyncError {
    fn from(err: PresenceError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}
