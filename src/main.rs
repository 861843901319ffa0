//! DocSync Server - synchronization core for a collaborative document editor
//!
//! A real-time collaboration server using:
//! - Single-writer edit locks with TTL reclamation instead of merge
//! - Linear undo/redo history per document
//! - Presence and typing indicators
//! - Axum WebSocket transport with a JSON protocol
//! - Sled embedded database for persisted content

use anyhow::Context;
use axum::{
    async_trait,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

mod config;
mod storage;
mod sync;

use config::ServerConfig;
use storage::{DocumentStorage, DocumentStore, MemoryStore, StorageConfig};
use sync::{
    protocol::{ServerMessage, SyncProtocol, PROTOCOL_VERSION},
    session::SessionInfo,
    SyncError, SyncServer,
};

/// Header set by the authenticating proxy
const PARTICIPANT_HEADER: &str = "x-participant-id";

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Session registry and message router
    sync_server: Arc<SyncServer>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(sync_server: Arc<SyncServer>) -> Self {
        Self {
            sync_server,
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_sessions: usize,
    active_connections: usize,
    attached_participants: usize,
}

#[derive(Debug, Deserialize)]
struct ParticipantQuery {
    participant_id: Option<String>,
}

/// Participant identity verified upstream, trusted as-is
#[derive(Debug, Clone)]
struct AuthenticatedParticipant(String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedParticipant
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(PARTICIPANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let participant = from_header.or_else(|| {
            Query::<ParticipantQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(query)| query.participant_id)
        });

        match participant.map(|p| p.trim().to_string()) {
            Some(p) if !p.is_empty() => Ok(AuthenticatedParticipant(p)),
            _ => Err((StatusCode::UNAUTHORIZED, "missing participant identity")),
        }
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync_server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_sessions: stats.active_sessions,
        active_connections: stats.active_connections,
        attached_participants: stats.attached_participants,
    })
}

/// Snapshot of a live document session
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<SessionInfo>, StatusCode> {
    state
        .sync_server
        .session_info(&document_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    AuthenticatedParticipant(participant_id): AuthenticatedParticipant,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    debug!("WebSocket upgrade request from {}", participant_id);
    ws.on_upgrade(move |socket| handle_websocket(socket, participant_id, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, participant_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut connection = state.sync_server.connect(participant_id, tx);
    let connection_id = connection.id;

    // Task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match SyncProtocol::encode_server(&msg) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for connection {}", connection_id);
    });

    // Inbound frames are handled inline so each one completes before the next
    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let decoded = match frame {
                    Some(Ok(Message::Text(text))) => SyncProtocol::decode_client(&text),
                    Some(Ok(Message::Binary(data))) => SyncProtocol::decode_client_bytes(&data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket error on {}: {}", connection_id, e);
                        break;
                    }
                };

                match decoded {
                    Ok(msg) => state.sync_server.handle_message(&mut connection, msg).await,
                    Err(e) => {
                        warn!("Failed to decode message from {}: {}", connection.participant_id, e);
                        connection.send(SyncProtocol::error_response(&SyncError::from(e), None));
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    send_task.abort();
    state.sync_server.disconnect(connection).await;
}

// ============================================================================
// ROUTER & STARTUP
// ============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/documents/:document_id", get(get_document))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn open_storage(config: &ServerConfig) -> anyhow::Result<Arc<dyn DocumentStorage>> {
    if config.uses_memory_storage() {
        warn!("Using in-memory storage - documents will not survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }

    info!("Initializing storage at: {}", config.storage_path);
    let store = DocumentStore::open(StorageConfig::new(&config.storage_path))
        .with_context(|| format!("failed to open storage at {}", config.storage_path))?;
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsync_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let storage = open_storage(&config)?;

    let sync_server = Arc::new(SyncServer::new(storage, config.sync.clone()));
    let background_handles = sync_server.clone().start_background_tasks();

    let state = Arc::new(AppState::new(sync_server.clone()));
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("DocSync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // The save task persists every dirty session before it exits.
    sync_server.shutdown();
    background_handles.wait().await;
    info!("Server stopped");

    Ok(())
}
