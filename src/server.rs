//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                         ┌── Peer B
//!          ▼                         ▼
//!   WsConnection ── SyncEngine ── WsConnection
//!                      │
//!          ┌───────────┼───────────────┐
//!          ▼           ▼               ▼
//!   DocumentRegistry  RoomManager   AuditSink
//!          │
//!          ▼
//!   SnapshotStore (RocksDB or in-memory)
//! ```
//!
//! Each accepted socket resolves its document id once, from the last path
//! segment of the handshake request (`/sync/<doc-id>`), and that id is
//! fixed for the connection's lifetime. Frames are opaque binary CRDT
//! updates; the server relays them without interpretation.
//!
//! Outbound traffic goes through a bounded per-connection channel drained
//! by a dedicated writer task, so one slow peer only ever suspends the
//! senders fanning out to it, never the accept loop or other rooms.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use async_trait::async_trait;

use crate::audit::{AuditSink, LogAuditSink, StatsSnapshot, SyncStats};
use crate::connection::{ConnId, Connection, ConnectionPhase, PhaseCell, SendError};
use crate::engine::SyncEngine;
use crate::entity::EntityStore;
use crate::merge::{MergeEngine, YrsMerge};
use crate::registry::{DocumentRegistry, RegistryConfig};
use crate::room::RoomManager;
use crate::storage::{
    MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Outbound frames buffered per connection
    pub outbound_buffer: usize,
    /// Debounce window for snapshot flushes, in milliseconds
    pub flush_debounce_ms: u64,
    /// How long an idle document stays resident, in seconds
    pub idle_grace_secs: u64,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            max_peers_per_room: 100,
            outbound_buffer: 256,
            flush_debounce_ms: 500,
            idle_grace_secs: 300,
            storage_path: None,
        }
    }
}

/// Frames queued for a connection's writer task.
enum OutboundFrame {
    Data(Arc<Vec<u8>>),
    Pong(Vec<u8>),
    Close(String),
}

/// WebSocket-backed [`Connection`].
struct WsConnection {
    id: ConnId,
    doc_id: String,
    phase: PhaseCell,
    outgoing: mpsc::Sender<OutboundFrame>,
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn doc_id(&self) -> &str {
        &self.doc_id
    }

    fn phase(&self) -> ConnectionPhase {
        self.phase.get()
    }

    fn advance_phase(&self, target: ConnectionPhase) -> bool {
        self.phase.advance(target)
    }

    async fn send(&self, frame: Arc<Vec<u8>>) -> Result<(), SendError> {
        if self.phase.is_closed() {
            return Err(SendError::Closed);
        }
        self.outgoing
            .send(OutboundFrame::Data(frame))
            .await
            .map_err(|_| SendError::Closed)
    }

    async fn close(&self, reason: &str) {
        if !self.phase.advance(ConnectionPhase::Closed) {
            return;
        }
        // Best-effort: if the outbound buffer is full the transport will
        // tear down when the socket drops.
        let _ = self
            .outgoing
            .try_send(OutboundFrame::Close(reason.to_string()));
    }
}

/// The sync server: accept loop plus the wired-up engine.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    entities: Arc<EntityStore>,
    store: Arc<dyn SnapshotStore>,
}

impl SyncServer {
    /// Create a server, opening RocksDB persistence when a storage path is
    /// configured and falling back to the in-memory store otherwise.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksSnapshotStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemorySnapshotStore::new()),
        };
        Ok(Self::with_snapshot_store(config, store))
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_snapshot_store(
            ServerConfig::default(),
            Arc::new(MemorySnapshotStore::new()),
        )
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Create over an explicit snapshot store (any [`SnapshotStore`]).
    pub fn with_snapshot_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let stats = Arc::new(SyncStats::new());
        let audit: Arc<dyn AuditSink> = Arc::new(LogAuditSink);
        let merge: Arc<dyn MergeEngine> = Arc::new(YrsMerge::new());

        let registry = Arc::new(DocumentRegistry::new(
            merge,
            store.clone(),
            stats.clone(),
            audit.clone(),
            RegistryConfig {
                flush_debounce: Duration::from_millis(config.flush_debounce_ms),
                idle_grace: Duration::from_secs(config.idle_grace_secs),
            },
        ));
        let engine = Arc::new(SyncEngine::new(
            registry,
            Arc::new(RoomManager::new()),
            store.clone(),
            audit,
            stats,
            config.max_peers_per_room,
        ));
        let entities = Arc::new(EntityStore::new(store.clone()));

        Self {
            config,
            engine,
            entities,
            store,
        }
    }

    /// Start listening for WebSocket connections. Runs until the listener
    /// fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let buffer = self.config.outbound_buffer;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(engine, buffer, stream, addr).await {
                    log::debug!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle for out-of-band operations (administrative deletion, stats).
    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    /// The versioned REST-facing entity store sharing this server's
    /// durable storage.
    pub fn entities(&self) -> Arc<EntityStore> {
        self.entities.clone()
    }

    pub fn snapshot_store(&self) -> Arc<dyn SnapshotStore> {
        self.store.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats()
    }
}

/// Resolve the document id from the handshake request path.
fn doc_id_from_path(path: &str) -> Option<String> {
    let id = path.trim_end_matches('/').rsplit('/').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Serve one WebSocket connection end to end.
async fn handle_connection(
    engine: Arc<SyncEngine>,
    buffer: usize,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut doc_id: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match doc_id_from_path(req.uri().path()) {
            Some(id) => {
                doc_id = Some(id);
                Ok(resp)
            }
            None => {
                let mut reject = ErrorResponse::new(Some("missing document id in path".into()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                Err(reject)
            }
        }
    })
    .await?;

    let doc_id = match doc_id {
        Some(id) => id,
        None => return Ok(()),
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(buffer);

    // Writer task: the only owner of the sink. Ends when every sender is
    // gone or a close frame goes out.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let result = match frame {
                OutboundFrame::Data(data) => {
                    ws_sender.send(Message::Binary(data.to_vec().into())).await
                }
                OutboundFrame::Pong(payload) => {
                    ws_sender.send(Message::Pong(payload.into())).await
                }
                OutboundFrame::Close(reason) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let conn: Arc<dyn Connection> = Arc::new(WsConnection {
        id: Uuid::new_v4(),
        doc_id: doc_id.clone(),
        phase: PhaseCell::new(),
        outgoing: out_tx.clone(),
    });

    log::info!(
        "WebSocket connection {} established from {addr} for doc {doc_id}",
        conn.id()
    );

    if engine.attach(conn.clone()).await.is_err() {
        // attach already closed and cleaned up the connection
        return Ok(());
    }

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                engine.handle_frame(&conn, bytes).await;
            }
            Ok(Message::Ping(payload)) => {
                let payload: Vec<u8> = payload.into();
                let _ = out_tx.try_send(OutboundFrame::Pong(payload));
            }
            Ok(Message::Close(_)) => {
                log::debug!("Connection {} closed by peer", conn.id());
                break;
            }
            Ok(_) => {
                // Text and pong frames carry nothing for the relay.
            }
            Err(e) => {
                log::debug!("WebSocket error from {addr}: {e}");
                break;
            }
        }
    }

    engine.detach(&conn).await;
    log::info!("Connection {} from {addr} closed", conn.id());
    Ok(())
}
