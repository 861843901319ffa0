//! SyncServer: the message router and session registry.
//!
//! This module implements the core synchronization server using:
//! - DashMap for the registry of active document sessions
//! - A per-session mutex that serializes every message for one document in
//!   router-arrival order
//! - Per-connection outbound channels for fan-out
//!
//! Component operations (history, lock, presence) run synchronously under the
//! session mutex; the guard is never held across an await. Storage calls and
//! socket I/O are the only suspension points.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::history::DEFAULT_MAX_ENTRIES;
use super::lock::LockError;
use super::presence::{PresenceEvent, DEFAULT_TYPING_IDLE};
use super::protocol::{ClientMessage, LockReleaseReason, ProtocolError, ServerMessage, SyncProtocol};
use super::session::{ConnectionId, DocumentSession, Outbox, SessionHandle, SessionInfo};
use super::{DocumentId, ParticipantId, SyncError, SyncResult};
use crate::storage::DocumentStorage;

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Lifetime of a lock token without renewal
    pub lock_ttl: Duration,
    /// Typing indicators older than this are auto-idled
    pub typing_idle: Duration,
    /// Interval of the lock/typing/eviction sweep
    pub sweep_interval: Duration,
    /// Interval of the retry pass over sessions with unpersisted content
    pub save_interval: Duration,
    /// How long an empty session is kept for reconnects
    pub eviction_grace: Duration,
    /// Maximum retained history entries per document
    pub max_history_entries: usize,
    /// Persist after this many history mutations (0 disables the trigger)
    pub persist_every_edits: usize,
    /// Maximum participants per document
    pub max_participants_per_document: usize,
    /// How long an evicted document is remembered for `session_evicted` reports
    pub evicted_retention: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            typing_idle: DEFAULT_TYPING_IDLE,
            sweep_interval: Duration::from_secs(2),
            save_interval: Duration::from_secs(30),
            eviction_grace: Duration::from_secs(60),
            max_history_entries: DEFAULT_MAX_ENTRIES,
            persist_every_edits: 20,
            max_participants_per_document: 50,
            evicted_retention: Duration::from_secs(60 * 60),
        }
    }
}

impl SyncServerConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_typing_idle(mut self, idle: Duration) -> Self {
        self.typing_idle = idle;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }

    pub fn with_max_history_entries(mut self, max: usize) -> Self {
        self.max_history_entries = max;
        self
    }

    pub fn with_persist_every_edits(mut self, edits: usize) -> Self {
        self.persist_every_edits = edits;
        self
    }

    pub fn with_max_participants_per_document(mut self, max: usize) -> Self {
        self.max_participants_per_document = max;
        self
    }

    pub fn with_evicted_retention(mut self, retention: Duration) -> Self {
        self.evicted_retention = retention;
        self
    }

    fn lock_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lock_ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    fn typing_idle_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.typing_idle).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    fn evicted_retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.evicted_retention)
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }
}

/// Router-side state of one transport connection.
///
/// Owned by the connection's receive loop, which awaits each message before
/// reading the next, so messages from one connection are handled in order.
pub struct ClientConnection {
    pub id: ConnectionId,
    pub participant_id: ParticipantId,
    tx: Outbox,
    /// Documents this connection is attached to
    documents: HashSet<DocumentId>,
}

impl ClientConnection {
    pub fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn is_attached(&self, document_id: &str) -> bool {
        self.documents.contains(document_id)
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub locks_expired: usize,
    pub typists_idled: usize,
    pub sessions_evicted: usize,
}

/// The main synchronization server
pub struct SyncServer {
    /// Server configuration
    config: SyncServerConfig,
    /// Active document sessions
    sessions: DashMap<DocumentId, Arc<SessionHandle>>,
    /// Recently evicted documents, pruned by the sweep after `evicted_retention`
    evicted: DashMap<DocumentId, chrono::DateTime<Utc>>,
    /// Durable backing for document content
    storage: Arc<dyn DocumentStorage>,
    /// Open transport connections
    connections: AtomicUsize,
    /// Server start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    pub fn new(storage: Arc<dyn DocumentStorage>, config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            sessions: DashMap::new(),
            evicted: DashMap::new(),
            storage,
            connections: AtomicUsize::new(0),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Register a connection for an authenticated participant
    pub fn connect(&self, participant_id: impl Into<String>, tx: Outbox) -> ClientConnection {
        let connection = ClientConnection {
            id: Uuid::new_v4(),
            participant_id: participant_id.into(),
            tx,
            documents: HashSet::new(),
        };
        self.connections.fetch_add(1, Ordering::SeqCst);
        info!(
            "Connection opened: participant={}, connection={}",
            connection.participant_id, connection.id
        );
        connection
    }

    /// Detach a closed connection from every document it was attached to
    pub async fn disconnect(&self, mut connection: ClientConnection) {
        let documents: Vec<DocumentId> = connection.documents.drain().collect();
        for document_id in documents {
            self.detach(&connection, &document_id);
        }
        self.connections.fetch_sub(1, Ordering::SeqCst);
        info!(
            "Connection closed: participant={}, connection={}",
            connection.participant_id, connection.id
        );
    }

    /// Process one inbound message. Failures are reported to the sender only.
    pub async fn handle_message(&self, connection: &mut ClientConnection, msg: ClientMessage) {
        debug!(
            "{} from {} on {:?}",
            msg.kind(),
            connection.participant_id,
            msg.document_id()
        );
        let document_id = msg.document_id().map(str::to_string);

        if let Err(err) = self.dispatch(connection, msg).await {
            debug!("Rejected message from {}: {}", connection.participant_id, err);
            connection.send(SyncProtocol::error_response(&err, document_id.as_deref()));
        }
    }

    async fn dispatch(&self, connection: &mut ClientConnection, msg: ClientMessage) -> SyncResult<()> {
        match msg {
            ClientMessage::Ping { timestamp } => {
                connection.send(ServerMessage::Pong {
                    timestamp,
                    server_time: Utc::now().timestamp(),
                });
                Ok(())
            }
            ClientMessage::Join { document_id } => self.join(connection, &document_id).await,
            ClientMessage::Leave { document_id } => self.leave(connection, &document_id),
            ClientMessage::Edit {
                document_id,
                content,
            } => self.edit(connection, &document_id, content),
            ClientMessage::Undo { document_id } => self.step_history(connection, &document_id, Step::Undo),
            ClientMessage::Redo { document_id } => self.step_history(connection, &document_id, Step::Redo),
            ClientMessage::TypingStart { document_id } => {
                self.set_typing(connection, &document_id, true)
            }
            ClientMessage::TypingStop { document_id } => {
                self.set_typing(connection, &document_id, false)
            }
            ClientMessage::LockAcquire { document_id } => self.acquire_lock(connection, &document_id),
            ClientMessage::LockRelease { document_id } => self.release_lock(connection, &document_id),
        }
    }

    async fn join(&self, connection: &mut ClientConnection, document_id: &str) -> SyncResult<()> {
        loop {
            let handle = self.get_or_load_session(document_id).await?;
            if self.attach(connection, document_id, &handle)? {
                connection.documents.insert(document_id.to_string());
                info!("{} joined document {}", connection.participant_id, document_id);
                return Ok(());
            }
            // The handle was evicted between lookup and lock; load a fresh one.
            debug!("Session {} evicted during attach, retrying", document_id);
        }
    }

    /// Returns false if the session was evicted before we got its lock
    fn attach(
        &self,
        connection: &ClientConnection,
        document_id: &str,
        handle: &SessionHandle,
    ) -> SyncResult<bool> {
        let mut session = handle.session.lock();
        if session.is_evicted() {
            return Ok(false);
        }

        let participant = connection.participant_id.as_str();
        let already_present = session.presence.contains(participant);
        if !already_present
            && session.participant_count() >= self.config.max_participants_per_document
        {
            return Err(SyncError::DocumentFull(document_id.to_string()));
        }

        let now = Utc::now();
        let attached = session.attach(participant, connection.id, connection.tx.clone(), now);

        if let Some(previous) = attached.replaced {
            info!(
                "{} took over document {} from an older connection",
                participant, document_id
            );
            let _ = previous.send(ServerMessage::Left {
                document_id: document_id.to_string(),
            });
        }

        connection.send(ServerMessage::Joined {
            document_id: document_id.to_string(),
            roster: attached.roster,
            lock_holder: session.lock.holder(now).cloned(),
            current_content: session.history.current_content().to_string(),
            index: session.history.cursor(),
        });

        if !already_present {
            broadcast_presence(
                &session,
                &PresenceEvent::Joined {
                    participant_id: participant.to_string(),
                },
            );
        }
        if let Some(event) = attached.typing_reset {
            broadcast_presence(&session, &event);
        }

        Ok(true)
    }

    async fn get_or_load_session(&self, document_id: &str) -> SyncResult<Arc<SessionHandle>> {
        let existing = self.sessions.get(document_id).map(|h| h.value().clone());
        if let Some(handle) = existing {
            return Ok(handle);
        }

        let initial_content = match self.storage.load_initial_content(document_id).await {
            Ok(content) => content.unwrap_or_default(),
            Err(e) => {
                warn!("Failed to load document {}: {}", document_id, e);
                if self.evicted.contains_key(document_id) {
                    return Err(SyncError::SessionEvicted(document_id.to_string()));
                }
                return Err(e.into());
            }
        };
        self.evicted.remove(document_id);

        let handle = self
            .sessions
            .entry(document_id.to_string())
            .or_insert_with(|| {
                info!("Created session for document {}", document_id);
                Arc::new(SessionHandle::new(DocumentSession::new(
                    document_id,
                    initial_content,
                    self.config.max_history_entries,
                )))
            })
            .clone();
        Ok(handle)
    }

    /// Session the connection is attached to, or a protocol error
    fn attached_session(
        &self,
        connection: &mut ClientConnection,
        document_id: &str,
    ) -> SyncResult<Arc<SessionHandle>> {
        let not_attached = || SyncError::from(ProtocolError::NotAttached(document_id.to_string()));

        if !connection.is_attached(document_id) {
            return Err(not_attached());
        }
        let handle = self
            .sessions
            .get(document_id)
            .map(|h| h.value().clone());
        match handle {
            Some(handle)
                if handle
                    .session
                    .lock()
                    .is_attached(&connection.participant_id, connection.id) =>
            {
                Ok(handle)
            }
            _ => {
                // taken over by another connection of the same participant
                connection.documents.remove(document_id);
                Err(not_attached())
            }
        }
    }

    fn leave(&self, connection: &mut ClientConnection, document_id: &str) -> SyncResult<()> {
        self.attached_session(connection, document_id)?;
        connection.documents.remove(document_id);
        self.detach(connection, document_id);
        connection.send(ServerMessage::Left {
            document_id: document_id.to_string(),
        });
        Ok(())
    }

    /// Remove the connection's participant from a document, cascading to the
    /// lock and scheduling eviction of an emptied session
    fn detach(&self, connection: &ClientConnection, document_id: &str) {
        let Some(handle) = self.sessions.get(document_id).map(|h| h.value().clone()) else {
            return;
        };
        let participant = connection.participant_id.as_str();

        let emptied = {
            let mut session = handle.session.lock();
            if !session.detach(participant, connection.id) {
                return;
            }

            broadcast_presence(
                &session,
                &PresenceEvent::Left {
                    participant_id: participant.to_string(),
                },
            );
            if session.lock.release(participant) {
                info!("Lock on {} released: holder {} left", document_id, participant);
                session.broadcast(
                    &ServerMessage::LockReleased {
                        document_id: document_id.to_string(),
                        holder: participant.to_string(),
                        reason: LockReleaseReason::HolderLeft,
                    },
                    None,
                );
            }

            let emptied = session.is_empty();
            if emptied {
                session.schedule_eviction(Instant::now() + self.config.eviction_grace);
            }
            emptied
        };

        info!("{} left document {}", participant, document_id);
        if emptied {
            debug!(
                "Document {} has no participants, evicting in {:?}",
                document_id, self.config.eviction_grace
            );
            self.schedule_persist(document_id, handle);
        }
    }

    fn edit(
        &self,
        connection: &mut ClientConnection,
        document_id: &str,
        content: String,
    ) -> SyncResult<()> {
        let handle = self.attached_session(connection, document_id)?;
        let participant = connection.participant_id.as_str();

        let persist_due = {
            let mut session = handle.session.lock();
            let now = Utc::now();
            self.require_lock(&mut session, participant, now)?;

            let entry = session.history.push(content, participant, now).clone();
            session.broadcast(
                &ServerMessage::DocumentUpdated {
                    document_id: document_id.to_string(),
                    content: entry.content,
                    author_id: entry.author_id,
                    index: entry.index,
                },
                Some(participant),
            );
            session.record_edit(self.config.persist_every_edits)
        };

        if persist_due {
            self.schedule_persist(document_id, handle);
        }
        Ok(())
    }

    fn step_history(
        &self,
        connection: &mut ClientConnection,
        document_id: &str,
        step: Step,
    ) -> SyncResult<()> {
        let handle = self.attached_session(connection, document_id)?;
        let participant = connection.participant_id.as_str();

        let persist_due = {
            let mut session = handle.session.lock();
            let now = Utc::now();
            self.require_lock(&mut session, participant, now)?;

            let entry = match step {
                Step::Undo => session.history.undo()?,
                Step::Redo => session.history.redo()?,
            }
            .clone();

            // Server-computed content, so the sender gets it too.
            session.broadcast(
                &ServerMessage::DocumentUpdated {
                    document_id: document_id.to_string(),
                    content: entry.content,
                    author_id: entry.author_id,
                    index: entry.index,
                },
                None,
            );
            session.record_edit(self.config.persist_every_edits)
        };

        if persist_due {
            self.schedule_persist(document_id, handle);
        }
        Ok(())
    }

    /// Check the participant holds the live lock and extend it
    fn require_lock(
        &self,
        session: &mut DocumentSession,
        participant: &str,
        now: chrono::DateTime<Utc>,
    ) -> SyncResult<()> {
        if let Some(token) = session.lock.expire(now) {
            info!(
                "Lock on {} held by {} expired",
                session.document_id(),
                token.holder
            );
            announce_expired(session, token.holder);
        }

        session
            .lock
            .renew(participant, self.config.lock_ttl_chrono(), now)
            .map(|_| ())
            .map_err(|_| SyncError::LockRequired(session.document_id().to_string()))
    }

    fn set_typing(
        &self,
        connection: &mut ClientConnection,
        document_id: &str,
        is_typing: bool,
    ) -> SyncResult<()> {
        let handle = self.attached_session(connection, document_id)?;
        let participant = connection.participant_id.as_str();

        let mut session = handle.session.lock();
        if let Some(event) = session.presence.set_typing(participant, is_typing, Utc::now())? {
            broadcast_presence(&session, &event);
        }
        Ok(())
    }

    fn acquire_lock(&self, connection: &mut ClientConnection, document_id: &str) -> SyncResult<()> {
        let handle = self.attached_session(connection, document_id)?;
        let participant = connection.participant_id.as_str();

        let mut session = handle.session.lock();
        match session
            .lock
            .acquire(participant, self.config.lock_ttl_chrono(), Utc::now())
        {
            Ok(acquired) => {
                if let Some(stale) = acquired.evicted {
                    info!("Lock on {} reclaimed from stale holder {}", document_id, stale);
                    announce_expired(&session, stale);
                }
                debug!("Lock on {} granted to {}", document_id, participant);
                session.broadcast(
                    &ServerMessage::LockGranted {
                        document_id: document_id.to_string(),
                        holder: acquired.token.holder,
                        expires_at: acquired.token.expires_at,
                    },
                    None,
                );
                Ok(())
            }
            Err(LockError::Held { holder }) => {
                connection.send(ServerMessage::LockDenied {
                    document_id: document_id.to_string(),
                    reason: "someone else is editing".to_string(),
                    holder,
                });
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn release_lock(&self, connection: &mut ClientConnection, document_id: &str) -> SyncResult<()> {
        let handle = self.attached_session(connection, document_id)?;
        let participant = connection.participant_id.as_str();

        let mut session = handle.session.lock();
        if !session.lock.release(participant) {
            return Err(SyncError::NotHolder(participant.to_string()));
        }
        debug!("Lock on {} released by {}", document_id, participant);
        session.broadcast(
            &ServerMessage::LockReleased {
                document_id: document_id.to_string(),
                holder: participant.to_string(),
                reason: LockReleaseReason::Released,
            },
            None,
        );
        Ok(())
    }

    fn schedule_persist(&self, document_id: &str, handle: Arc<SessionHandle>) {
        let storage = self.storage.clone();
        let document_id = document_id.to_string();
        tokio::spawn(async move {
            persist_session(storage.as_ref(), &document_id, &handle).await;
        });
    }

    /// Expire stale locks, idle quiet typists and evict sessions past their
    /// grace period
    pub async fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let now = Utc::now();
        let tick = Instant::now();
        let typing_idle = self.config.typing_idle_chrono();

        let retention = self.config.evicted_retention_chrono();
        self.evicted.retain(|_, evicted_at| now - *evicted_at < retention);

        let handles: Vec<(DocumentId, Arc<SessionHandle>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut due = Vec::new();
        for (document_id, handle) in handles {
            let mut session = handle.session.lock();

            if let Some(token) = session.lock.expire(now) {
                info!("Lock on {} held by {} expired", document_id, token.holder);
                announce_expired(&session, token.holder);
                stats.locks_expired += 1;
            }

            for event in session.presence.sweep_idle(now, typing_idle) {
                broadcast_presence(&session, &event);
                stats.typists_idled += 1;
            }

            if session.is_eviction_due(tick) {
                due.push((document_id, handle.clone()));
            }
        }

        for (document_id, handle) in due {
            // Persist while the session is still registered, so a join that
            // races the eviction either finds it here or loads the saved copy.
            persist_session(self.storage.as_ref(), &document_id, &handle).await;

            let removed = self.sessions.remove_if(&document_id, |_, candidate| {
                if !Arc::ptr_eq(candidate, &handle) {
                    return false;
                }
                let mut session = candidate.session.lock();
                if session.is_eviction_due(Instant::now()) && !session.is_dirty() {
                    session.mark_evicted();
                    true
                } else {
                    false
                }
            });

            if removed.is_some() {
                self.evicted.insert(document_id.clone(), now);
                stats.sessions_evicted += 1;
                info!("Evicted idle session: {}", document_id);
            }
        }

        stats
    }

    /// Persist every session with unsaved content. Returns how many were attempted.
    pub async fn persist_dirty_sessions(&self) -> usize {
        let handles: Vec<(DocumentId, Arc<SessionHandle>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().session.lock().is_dirty())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (document_id, handle) in &handles {
            persist_session(self.storage.as_ref(), document_id, handle).await;
        }
        handles.len()
    }

    pub fn session_info(&self, document_id: &str) -> Option<SessionInfo> {
        self.sessions
            .get(document_id)
            .map(|handle| handle.session.lock().info(Utc::now()))
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.sessions.len(),
            active_connections: self.connections.load(Ordering::SeqCst),
            attached_participants: self
                .sessions
                .iter()
                .map(|entry| entry.value().session.lock().participant_count())
                .sum(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Start background tasks (sweep loop, save loop)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let sweep_interval = server.config.sweep_interval;

        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let stats = server.sweep().await;
                        if stats != SweepStats::default() {
                            debug!("Sweep: {:?}", stats);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Sweep task shutting down");
                        break;
                    }
                }
            }
        });

        let server = self.clone();
        let save_interval = server.config.save_interval;

        let save_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(save_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = server.persist_dirty_sessions().await;
                        if saved > 0 {
                            debug!("Persisted {} dirty documents", saved);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Save task shutting down");
                        server.persist_dirty_sessions().await;
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            sweep_task: sweep_handle,
            save_task: save_handle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Undo,
    Redo,
}

/// Tell every attached participant that `holder`'s token lapsed
fn announce_expired(session: &DocumentSession, holder: ParticipantId) {
    session.broadcast(
        &ServerMessage::LockReleased {
            document_id: session.document_id().to_string(),
            holder,
            reason: LockReleaseReason::Expired,
        },
        None,
    );
}

/// Fan out a presence transition to everyone but its subject
fn broadcast_presence(session: &DocumentSession, event: &PresenceEvent) {
    let document_id = session.document_id().to_string();
    let participant_id = event.participant_id().to_string();
    let msg = match event {
        PresenceEvent::Joined { .. } => ServerMessage::ParticipantJoined {
            document_id,
            participant_id,
        },
        PresenceEvent::Left { .. } => ServerMessage::ParticipantLeft {
            document_id,
            participant_id,
        },
        PresenceEvent::TypingChanged { is_typing, .. } => ServerMessage::TypingChanged {
            document_id,
            participant_id,
            is_typing: *is_typing,
        },
    };
    session.broadcast(&msg, Some(event.participant_id()));
}

/// Persist the session's current content if it changed since the last persist.
///
/// Persists of one session are serialized by its gate and each takes the
/// latest snapshot, so a slow older write never lands after a newer one.
async fn persist_session(storage: &dyn DocumentStorage, document_id: &str, handle: &SessionHandle) {
    let _gate = handle.persist_gate.lock().await;
    let snapshot = { handle.session.lock().take_persist_snapshot() };
    let Some(content) = snapshot else {
        return;
    };

    match storage.persist(document_id, &content).await {
        Ok(()) => debug!("Persisted document {}", document_id),
        Err(e) => {
            error!("Failed to persist document {}: {}", document_id, e);
            handle.session.lock().mark_dirty();
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_sessions: usize,
    pub active_connections: usize,
    pub attached_participants: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub sweep_task: tokio::task::JoinHandle<()>,
    pub save_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.sweep_task, self.save_task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::sync::protocol::ErrorCode;
    use tokio::sync::mpsc;

    type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

    fn test_server(config: SyncServerConfig) -> (Arc<MemoryStore>, SyncServer) {
        let store = Arc::new(MemoryStore::new());
        let server = SyncServer::new(store.clone(), config);
        (store, server)
    }

    fn connect(server: &SyncServer, participant: &str) -> (ClientConnection, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (server.connect(participant, tx), rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn error_code(msgs: &[ServerMessage]) -> Option<ErrorCode> {
        msgs.iter().find_map(|m| match m {
            ServerMessage::Error { code, .. } => Some(*code),
            _ => None,
        })
    }

    fn doc(id: &str) -> String {
        id.to_string()
    }

    async fn join(server: &SyncServer, conn: &mut ClientConnection, document_id: &str) {
        server
            .handle_message(conn, ClientMessage::Join { document_id: doc(document_id) })
            .await;
    }

    async fn send(server: &SyncServer, conn: &mut ClientConnection, msg: ClientMessage) {
        server.handle_message(conn, msg).await;
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_editing_session_end_to_end() {
        let (store, server) = test_server(SyncServerConfig::default());
        let (mut alice, mut alice_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");

        join(&server, &mut alice, "doc").await;
        match drain(&mut alice_rx).as_slice() {
            [ServerMessage::Joined { roster, current_content, index, lock_holder, .. }] => {
                assert_eq!(roster.len(), 1);
                assert_eq!(current_content, "");
                assert_eq!(*index, None);
                assert_eq!(*lock_holder, None);
            }
            other => panic!("unexpected: {other:?}"),
        }

        join(&server, &mut bob, "doc").await;
        match drain(&mut bob_rx).as_slice() {
            [ServerMessage::Joined { roster, .. }] => {
                let ids: Vec<_> = roster.iter().map(|p| p.participant_id.as_str()).collect();
                assert_eq!(ids, vec!["alice", "bob"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::ParticipantJoined {
                document_id: doc("doc"),
                participant_id: doc("bob"),
            }]
        );

        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        let granted = drain(&mut bob_rx);
        assert!(matches!(
            granted.as_slice(),
            [ServerMessage::LockGranted { holder, .. }] if holder == "alice"
        ));
        drain(&mut alice_rx);

        for content in ["one", "two"] {
            send(
                &server,
                &mut alice,
                ClientMessage::Edit {
                    document_id: doc("doc"),
                    content: content.to_string(),
                },
            )
            .await;
        }
        // not echoed to the author
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(
            drain(&mut bob_rx),
            vec![
                ServerMessage::DocumentUpdated {
                    document_id: doc("doc"),
                    content: doc("one"),
                    author_id: doc("alice"),
                    index: 0,
                },
                ServerMessage::DocumentUpdated {
                    document_id: doc("doc"),
                    content: doc("two"),
                    author_id: doc("alice"),
                    index: 1,
                },
            ]
        );

        send(&server, &mut alice, ClientMessage::Undo { document_id: doc("doc") }).await;
        let expected = ServerMessage::DocumentUpdated {
            document_id: doc("doc"),
            content: doc("one"),
            author_id: doc("alice"),
            index: 0,
        };
        assert_eq!(drain(&mut alice_rx), vec![expected.clone()]);
        assert_eq!(drain(&mut bob_rx), vec![expected]);

        send(&server, &mut alice, ClientMessage::Undo { document_id: doc("doc") }).await;
        assert_eq!(error_code(&drain(&mut alice_rx)), Some(ErrorCode::NoHistory));
        assert!(drain(&mut bob_rx).is_empty());

        // alice disconnects while holding the lock
        server.disconnect(alice).await;
        let msgs = drain(&mut bob_rx);
        assert!(msgs.contains(&ServerMessage::ParticipantLeft {
            document_id: doc("doc"),
            participant_id: doc("alice"),
        }));
        assert!(msgs.contains(&ServerMessage::LockReleased {
            document_id: doc("doc"),
            holder: doc("alice"),
            reason: LockReleaseReason::HolderLeft,
        }));

        send(&server, &mut bob, ClientMessage::Leave { document_id: doc("doc") }).await;
        assert_eq!(drain(&mut bob_rx), vec![ServerMessage::Left { document_id: doc("doc") }]);

        settle().await;
        assert_eq!(store.get("doc").as_deref(), Some("one"));
        assert!(server.session_info("doc").unwrap().eviction_pending);
    }

    #[tokio::test]
    async fn test_branch_discard_through_router() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut alice, mut rx) = connect(&server, "alice");
        join(&server, &mut alice, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        drain(&mut rx);

        let edit = |content: &str| ClientMessage::Edit {
            document_id: doc("doc"),
            content: content.to_string(),
        };

        send(&server, &mut alice, edit("v1")).await;
        send(&server, &mut alice, ClientMessage::Undo { document_id: doc("doc") }).await;
        assert_eq!(error_code(&drain(&mut rx)), Some(ErrorCode::NoHistory));

        send(&server, &mut alice, edit("v2")).await;
        send(&server, &mut alice, ClientMessage::Undo { document_id: doc("doc") }).await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::DocumentUpdated { content, index: 0, .. }] if content == "v1"
        ));

        send(&server, &mut alice, edit("v3")).await;
        let info = server.session_info("doc").unwrap();
        assert_eq!((info.history_len, info.cursor), (2, Some(1)));

        send(&server, &mut alice, ClientMessage::Redo { document_id: doc("doc") }).await;
        assert_eq!(error_code(&drain(&mut rx)), Some(ErrorCode::NoFuture));
    }

    #[tokio::test]
    async fn test_edit_without_lock_is_rejected() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut alice, mut alice_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut alice, "doc").await;
        join(&server, &mut bob, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        send(
            &server,
            &mut bob,
            ClientMessage::Edit {
                document_id: doc("doc"),
                content: doc("sneaky"),
            },
        )
        .await;

        assert_eq!(error_code(&drain(&mut bob_rx)), Some(ErrorCode::LockRequired));
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(server.session_info("doc").unwrap().history_len, 0);

        send(&server, &mut bob, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [ServerMessage::LockDenied { holder, .. }] if holder == "alice"
        ));
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_typing_seen_by_others_only() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut alice, mut alice_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut alice, "doc").await;
        join(&server, &mut bob, "doc").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        send(&server, &mut alice, ClientMessage::TypingStart { document_id: doc("doc") }).await;
        send(&server, &mut alice, ClientMessage::TypingStart { document_id: doc("doc") }).await;

        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::TypingChanged {
                document_id: doc("doc"),
                participant_id: doc("alice"),
                is_typing: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_typing_auto_idles_on_sweep() {
        let config = SyncServerConfig::default().with_typing_idle(Duration::from_millis(10));
        let (_store, server) = test_server(config);
        let (mut alice, _alice_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut alice, "doc").await;
        join(&server, &mut bob, "doc").await;
        send(&server, &mut alice, ClientMessage::TypingStart { document_id: doc("doc") }).await;
        drain(&mut bob_rx);

        settle().await;
        let stats = server.sweep().await;

        assert_eq!(stats.typists_idled, 1);
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::TypingChanged {
                document_id: doc("doc"),
                participant_id: doc("alice"),
                is_typing: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let config = SyncServerConfig::default().with_lock_ttl(Duration::from_millis(10));
        let (_store, server) = test_server(config);
        let (mut alice, mut alice_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut alice, "doc").await;
        join(&server, &mut bob, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        settle().await;
        send(&server, &mut bob, ClientMessage::LockAcquire { document_id: doc("doc") }).await;

        let msgs = drain(&mut alice_rx);
        assert!(matches!(
            msgs.as_slice(),
            [
                ServerMessage::LockReleased { holder, reason: LockReleaseReason::Expired, .. },
                ServerMessage::LockGranted { holder: granted, .. },
            ] if holder == "alice" && granted == "bob"
        ));

        // alice's lapsed token no longer authorizes edits
        send(
            &server,
            &mut alice,
            ClientMessage::Edit {
                document_id: doc("doc"),
                content: doc("late"),
            },
        )
        .await;
        assert_eq!(error_code(&drain(&mut alice_rx)), Some(ErrorCode::LockRequired));
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_lock() {
        let config = SyncServerConfig::default().with_lock_ttl(Duration::from_millis(10));
        let (_store, server) = test_server(config);
        let (mut alice, mut alice_rx) = connect(&server, "alice");
        join(&server, &mut alice, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        drain(&mut alice_rx);

        settle().await;
        assert_eq!(server.sweep().await.locks_expired, 1);
        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [ServerMessage::LockReleased { reason: LockReleaseReason::Expired, .. }]
        ));
        assert!(server.session_info("doc").unwrap().lock_holder.is_none());
    }

    #[tokio::test]
    async fn test_release_by_non_holder() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut alice, mut alice_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut alice, "doc").await;
        join(&server, &mut bob, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        send(&server, &mut bob, ClientMessage::LockRelease { document_id: doc("doc") }).await;

        assert_eq!(error_code(&drain(&mut bob_rx)), Some(ErrorCode::NotHolder));
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(
            server.session_info("doc").unwrap().lock_holder.as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn test_message_for_unjoined_document() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut alice, mut alice_rx) = connect(&server, "alice");

        send(&server, &mut alice, ClientMessage::Undo { document_id: doc("doc") }).await;

        let msgs = drain(&mut alice_rx);
        assert_eq!(error_code(&msgs), Some(ErrorCode::ProtocolError));
        assert!(server.session_info("doc").is_none());

        send(&server, &mut alice, ClientMessage::Ping { timestamp: 7 }).await;
        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [ServerMessage::Pong { timestamp: 7, .. }]
        ));
    }

    #[tokio::test]
    async fn test_rejoin_within_grace_keeps_history() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut alice, mut alice_rx) = connect(&server, "alice");
        join(&server, &mut alice, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        for content in ["a", "b"] {
            send(
                &server,
                &mut alice,
                ClientMessage::Edit {
                    document_id: doc("doc"),
                    content: content.to_string(),
                },
            )
            .await;
        }
        server.disconnect(alice).await;
        drain(&mut alice_rx);

        assert_eq!(server.sweep().await.sessions_evicted, 0);

        let (mut alice, mut alice_rx) = connect(&server, "alice");
        join(&server, &mut alice, "doc").await;
        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [ServerMessage::Joined { current_content, index: Some(1), .. }] if current_content == "b"
        ));
        assert!(!server.session_info("doc").unwrap().eviction_pending);
    }

    #[tokio::test]
    async fn test_eviction_persists_and_reloads() {
        let config = SyncServerConfig::default().with_eviction_grace(Duration::ZERO);
        let (store, server) = test_server(config);
        let (mut alice, _alice_rx) = connect(&server, "alice");
        join(&server, &mut alice, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        send(
            &server,
            &mut alice,
            ClientMessage::Edit {
                document_id: doc("doc"),
                content: doc("kept"),
            },
        )
        .await;
        server.disconnect(alice).await;

        assert_eq!(server.sweep().await.sessions_evicted, 1);
        assert!(server.session_info("doc").is_none());
        assert_eq!(store.get("doc").as_deref(), Some("kept"));

        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut bob, "doc").await;
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [ServerMessage::Joined { current_content, index: None, .. }] if current_content == "kept"
        ));
    }

    #[tokio::test]
    async fn test_evicted_session_unavailable_when_storage_fails() {
        let config = SyncServerConfig::default().with_eviction_grace(Duration::ZERO);
        let (store, server) = test_server(config);
        let (mut alice, _alice_rx) = connect(&server, "alice");
        join(&server, &mut alice, "doc").await;
        server.disconnect(alice).await;
        assert_eq!(server.sweep().await.sessions_evicted, 1);

        store.set_fail_loads(true);
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut bob, "doc").await;
        assert_eq!(error_code(&drain(&mut bob_rx)), Some(ErrorCode::SessionEvicted));

        join(&server, &mut bob, "fresh").await;
        assert_eq!(error_code(&drain(&mut bob_rx)), Some(ErrorCode::StorageUnavailable));
        assert!(server.session_info("fresh").is_none());
    }

    #[tokio::test]
    async fn test_failed_persist_is_retried() {
        let config = SyncServerConfig::default().with_persist_every_edits(1);
        let (store, server) = test_server(config);
        store.set_fail_persists(true);

        let (mut alice, _alice_rx) = connect(&server, "alice");
        join(&server, &mut alice, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        send(
            &server,
            &mut alice,
            ClientMessage::Edit {
                document_id: doc("doc"),
                content: doc("v1"),
            },
        )
        .await;
        settle().await;

        assert!(store.persist_calls() >= 1);
        assert!(store.get("doc").is_none());

        store.set_fail_persists(false);
        assert_eq!(server.persist_dirty_sessions().await, 1);
        assert_eq!(store.get("doc").as_deref(), Some("v1"));
        assert_eq!(server.persist_dirty_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_second_connection_takes_over() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut first, mut first_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut first, "doc").await;
        join(&server, &mut bob, "doc").await;
        drain(&mut first_rx);
        drain(&mut bob_rx);

        let (mut second, mut second_rx) = connect(&server, "alice");
        join(&server, &mut second, "doc").await;

        assert_eq!(drain(&mut first_rx), vec![ServerMessage::Left { document_id: doc("doc") }]);
        assert!(matches!(drain(&mut second_rx).as_slice(), [ServerMessage::Joined { .. }]));
        // same participant, so no join announcement
        assert!(drain(&mut bob_rx).is_empty());

        send(&server, &mut first, ClientMessage::TypingStart { document_id: doc("doc") }).await;
        assert_eq!(error_code(&drain(&mut first_rx)), Some(ErrorCode::ProtocolError));
        assert!(!first.is_attached("doc"));

        // closing the stale connection leaves the live one in place
        server.disconnect(first).await;
        assert!(drain(&mut bob_rx).is_empty());
        assert_eq!(server.session_info("doc").unwrap().roster.len(), 2);
    }

    #[tokio::test]
    async fn test_lapsed_lock_announced_on_next_edit() {
        let config = SyncServerConfig::default().with_lock_ttl(Duration::from_millis(10));
        let (_store, server) = test_server(config);
        let (mut alice, mut alice_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut alice, "doc").await;
        join(&server, &mut bob, "doc").await;
        send(&server, &mut alice, ClientMessage::LockAcquire { document_id: doc("doc") }).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        settle().await;
        send(
            &server,
            &mut alice,
            ClientMessage::Edit {
                document_id: doc("doc"),
                content: doc("late"),
            },
        )
        .await;

        let expired = ServerMessage::LockReleased {
            document_id: doc("doc"),
            holder: doc("alice"),
            reason: LockReleaseReason::Expired,
        };
        let alice_msgs = drain(&mut alice_rx);
        assert_eq!(alice_msgs.first(), Some(&expired));
        assert_eq!(error_code(&alice_msgs), Some(ErrorCode::LockRequired));
        assert_eq!(drain(&mut bob_rx), vec![expired]);

        assert_eq!(server.sweep().await.locks_expired, 0);
        assert!(server.session_info("doc").unwrap().lock_holder.is_none());
    }

    #[tokio::test]
    async fn test_rejoin_clears_typing_for_others() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut first, _first_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut first, "doc").await;
        join(&server, &mut bob, "doc").await;
        send(&server, &mut first, ClientMessage::TypingStart { document_id: doc("doc") }).await;
        drain(&mut bob_rx);

        let (mut second, mut second_rx) = connect(&server, "alice");
        join(&server, &mut second, "doc").await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::TypingChanged {
                document_id: doc("doc"),
                participant_id: doc("alice"),
                is_typing: false,
            }]
        );
        assert!(matches!(drain(&mut second_rx).as_slice(), [ServerMessage::Joined { .. }]));
    }

    #[tokio::test]
    async fn test_evicted_documents_are_forgotten_after_retention() {
        let config = SyncServerConfig::default()
            .with_eviction_grace(Duration::ZERO)
            .with_evicted_retention(Duration::ZERO);
        let (store, server) = test_server(config);
        let (mut alice, _alice_rx) = connect(&server, "alice");
        join(&server, &mut alice, "doc").await;
        server.disconnect(alice).await;
        assert_eq!(server.sweep().await.sessions_evicted, 1);

        store.set_fail_loads(true);
        let (mut bob, mut bob_rx) = connect(&server, "bob");
        join(&server, &mut bob, "doc").await;
        assert_eq!(error_code(&drain(&mut bob_rx)), Some(ErrorCode::SessionEvicted));

        server.sweep().await;
        join(&server, &mut bob, "doc").await;
        assert_eq!(error_code(&drain(&mut bob_rx)), Some(ErrorCode::StorageUnavailable));
    }

    #[tokio::test]
    async fn test_document_full() {
        let config = SyncServerConfig::default().with_max_participants_per_document(1);
        let (_store, server) = test_server(config);
        let (mut alice, _alice_rx) = connect(&server, "alice");
        let (mut bob, mut bob_rx) = connect(&server, "bob");

        join(&server, &mut alice, "doc").await;
        join(&server, &mut bob, "doc").await;

        assert_eq!(error_code(&drain(&mut bob_rx)), Some(ErrorCode::DocumentFull));
        assert!(!bob.is_attached("doc"));
    }

    #[tokio::test]
    async fn test_stats() {
        let (_store, server) = test_server(SyncServerConfig::default());
        let (mut alice, _alice_rx) = connect(&server, "alice");
        let (mut bob, _bob_rx) = connect(&server, "bob");
        join(&server, &mut alice, "doc-1").await;
        join(&server, &mut alice, "doc-2").await;
        join(&server, &mut bob, "doc-1").await;

        let stats = server.stats();
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.attached_participants, 3);

        server.disconnect(alice).await;
        assert_eq!(server.stats().active_connections, 1);
        assert_eq!(server.stats().attached_participants, 1);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let config = SyncServerConfig::default()
            .with_sweep_interval(Duration::from_millis(5))
            .with_save_interval(Duration::from_millis(5));
        let (_store, server) = test_server(config);
        let server = Arc::new(server);

        let handles = server.clone().start_background_tasks();
        settle().await;
        server.shutdown();

        tokio::time::timeout(Duration::from_secs(1), handles.wait())
            .await
            .expect("background tasks did not stop");
    }
}
