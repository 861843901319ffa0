//! Per-document session state.
//!
//! A session exclusively owns the history, lock and roster of one document,
//! plus the outbound channels of the connections attached to it. All of it is
//! mutated under the session mutex held by the router, so nothing in here
//! does its own locking.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::history::VersionHistory;
use super::lock::DocumentLock;
use super::presence::{PresenceEvent, PresenceState, SessionPresence};
use super::protocol::ServerMessage;
use super::{DocumentId, ParticipantId};

/// Identifier of one transport connection
pub type ConnectionId = Uuid;

/// Outbound queue of one connection
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// A participant's live attachment to the session
struct Attachment {
    connection_id: ConnectionId,
    tx: Outbox,
}

/// Outcome of attaching a participant
pub struct Attached {
    /// Roster in join order, including the participant
    pub roster: Vec<PresenceState>,
    /// Outbox of the connection this attach took over from
    pub replaced: Option<Outbox>,
    /// Typing indicator cleared by a rejoin
    pub typing_reset: Option<PresenceEvent>,
}

/// Registry entry: the session plus a gate that orders persists of it
pub struct SessionHandle {
    pub(crate) session: Mutex<DocumentSession>,
    pub(crate) persist_gate: tokio::sync::Mutex<()>,
}

impl SessionHandle {
    pub fn new(session: DocumentSession) -> Self {
        Self {
            session: Mutex::new(session),
            persist_gate: tokio::sync::Mutex::new(()),
        }
    }
}

pub struct DocumentSession {
    document_id: DocumentId,
    pub history: VersionHistory,
    pub lock: DocumentLock,
    pub presence: SessionPresence,
    attachments: HashMap<ParticipantId, Attachment>,
    /// Set when the last participant detached
    evict_at: Option<Instant>,
    /// Set once the session has been removed from the registry
    evicted: bool,
    /// Content changed since the last successful persist
    dirty: bool,
    edits_since_persist: usize,
    created_at: DateTime<Utc>,
}

impl DocumentSession {
    pub fn new(
        document_id: impl Into<String>,
        initial_content: impl Into<String>,
        max_history_entries: usize,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            history: VersionHistory::new(initial_content, max_history_entries),
            lock: DocumentLock::new(),
            presence: SessionPresence::new(),
            attachments: HashMap::new(),
            evict_at: None,
            evicted: false,
            dirty: false,
            edits_since_persist: 0,
            created_at: Utc::now(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Attach a participant through `connection_id`.
    ///
    /// Cancels a pending eviction. If the participant was attached through a
    /// different connection, that attachment is replaced and its outbox is
    /// returned so the caller can tell it.
    pub fn attach(
        &mut self,
        participant_id: &str,
        connection_id: ConnectionId,
        tx: Outbox,
        now: DateTime<Utc>,
    ) -> Attached {
        self.evict_at = None;
        let (roster, typing_reset) = self.presence.join(participant_id, now);
        let replaced = self
            .attachments
            .insert(
                participant_id.to_string(),
                Attachment { connection_id, tx },
            )
            .filter(|previous| previous.connection_id != connection_id)
            .map(|previous| previous.tx);
        Attached {
            roster,
            replaced,
            typing_reset,
        }
    }

    pub fn is_attached(&self, participant_id: &str, connection_id: ConnectionId) -> bool {
        self.attachments
            .get(participant_id)
            .is_some_and(|a| a.connection_id == connection_id)
    }

    /// Remove the participant's attachment and presence if they belong to
    /// `connection_id`. Returns false when nothing was detached.
    pub fn detach(&mut self, participant_id: &str, connection_id: ConnectionId) -> bool {
        if !self.is_attached(participant_id, connection_id) {
            return false;
        }
        self.attachments.remove(participant_id);
        self.presence.leave(participant_id);
        true
    }

    /// Send to every attached participant except `exclude`
    pub fn broadcast(&self, msg: &ServerMessage, exclude: Option<&str>) {
        for (participant_id, attachment) in &self.attachments {
            if exclude == Some(participant_id.as_str()) {
                continue;
            }
            let _ = attachment.tx.send(msg.clone());
        }
    }

    pub fn participant_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn schedule_eviction(&mut self, at: Instant) {
        self.evict_at = Some(at);
    }

    pub fn eviction_pending(&self) -> bool {
        self.evict_at.is_some()
    }

    pub fn is_eviction_due(&self, now: Instant) -> bool {
        self.is_empty() && self.evict_at.is_some_and(|at| at <= now)
    }

    pub fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Record a history mutation. Returns true once `persist_every` mutations
    /// have accumulated since the last persist.
    pub fn record_edit(&mut self, persist_every: usize) -> bool {
        self.dirty = true;
        self.edits_since_persist += 1;
        persist_every > 0 && self.edits_since_persist >= persist_every
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Current content if it needs persisting; clears the dirty state
    pub fn take_persist_snapshot(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.edits_since_persist = 0;
        Some(self.history.current_content().to_string())
    }

    pub fn info(&self, now: DateTime<Utc>) -> SessionInfo {
        SessionInfo {
            document_id: self.document_id.clone(),
            roster: self.presence.roster(),
            lock_holder: self.lock.holder(now).cloned(),
            history_len: self.history.len(),
            cursor: self.history.cursor(),
            eviction_pending: self.eviction_pending(),
            created_at: self.created_at,
        }
    }
}

/// Read-only snapshot of a session for the HTTP API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub document_id: DocumentId,
    pub roster: Vec<PresenceState>,
    pub lock_holder: Option<ParticipantId>,
    pub history_len: usize,
    pub cursor: Option<usize>,
    pub eviction_pending: bool,
    pub created_at: DateTime<Utc>,
}
