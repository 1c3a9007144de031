//! Protocol orchestration: join, relay, disconnect, delete.
//!
//! The engine owns nothing mutable itself; it drives the registry and the
//! room manager and reports to the audit sink. Per connection the flow is:
//!
//! ```text
//! attach ──► checkout document ──► join room ──► send full state
//!   │            (Connecting)                      (Syncing → Active)
//!   ▼
//! handle_frame ──► merge ──► broadcast to N-1 peers (original bytes)
//!   │                └── malformed: drop, warn, connection stays open
//!   ▼
//! detach ──► leave room ──► release registry ref (flush if last)
//! ```
//!
//! The server relays updates verbatim. It never re-encodes a payload; the
//! merge engine is the only component that interprets update bytes, and
//! only to fold them into the authoritative state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::audit::{AuditEvent, AuditSink, StatsSnapshot, SyncStats};
use crate::connection::{ConnId, Connection, ConnectionPhase};
use crate::merge::MergeError;
use crate::registry::{DocumentHandle, DocumentRegistry};
use crate::room::RoomManager;
use crate::storage::SnapshotStore;

/// Errors surfaced to the transport layer during attach.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// The room already holds the configured maximum number of peers.
    RoomFull { doc_id: String, limit: usize },
    /// The peer vanished before the initial state sync completed.
    ConnectionClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::RoomFull { doc_id, limit } => {
                write!(f, "Room {doc_id} is full ({limit} peers)")
            }
            SyncError::ConnectionClosed => write!(f, "Connection closed during sync"),
        }
    }
}

impl std::error::Error for SyncError {}

/// The sync engine.
pub struct SyncEngine {
    registry: Arc<DocumentRegistry>,
    rooms: Arc<RoomManager>,
    store: Arc<dyn SnapshotStore>,
    audit: Arc<dyn AuditSink>,
    stats: Arc<SyncStats>,
    /// Registry reference held per attached connection, released exactly
    /// once on detach.
    sessions: RwLock<HashMap<ConnId, Arc<DocumentHandle>>>,
    /// Maximum peers per room; 0 disables the cap.
    max_peers_per_room: usize,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        rooms: Arc<RoomManager>,
        store: Arc<dyn SnapshotStore>,
        audit: Arc<dyn AuditSink>,
        stats: Arc<SyncStats>,
        max_peers_per_room: usize,
    ) -> Self {
        Self {
            registry,
            rooms,
            store,
            audit,
            stats,
            sessions: RwLock::new(HashMap::new()),
            max_peers_per_room,
        }
    }

    /// Bring a freshly-handshaken connection into its document's room and
    /// send it the current merged state as one message.
    ///
    /// On error the connection has already been closed and cleaned up;
    /// callers must not `detach` it afterwards.
    pub async fn attach(&self, conn: Arc<dyn Connection>) -> Result<(), SyncError> {
        let doc_id = conn.doc_id().to_string();

        if self.max_peers_per_room > 0
            && self.rooms.connection_count(&doc_id).await >= self.max_peers_per_room
        {
            log::warn!(
                "Rejecting connection {} to {doc_id}: room full ({} peers)",
                conn.id(),
                self.max_peers_per_room
            );
            conn.close("room full").await;
            return Err(SyncError::RoomFull {
                doc_id,
                limit: self.max_peers_per_room,
            });
        }

        let handle = self.registry.checkout(&doc_id).await;
        self.sessions
            .write()
            .await
            .insert(conn.id(), handle.clone());
        self.rooms.join(conn.clone()).await;
        conn.advance_phase(ConnectionPhase::Syncing);

        // The snapshot is taken under the document's merge lock, so the
        // joiner never observes a half-merged state.
        let snapshot = self.registry.full_state_of(&handle).await;
        if conn.send(Arc::new(snapshot)).await.is_err() {
            log::debug!("Connection {} dropped during initial sync", conn.id());
            self.detach(&conn).await;
            return Err(SyncError::ConnectionClosed);
        }
        conn.advance_phase(ConnectionPhase::Active);

        self.stats.connection_opened();
        self.audit.emit(&AuditEvent::ConnectionOpened {
            doc_id,
            conn_id: conn.id(),
        });
        Ok(())
    }

    /// Process one inbound binary frame from a peer: merge it, then relay
    /// the original bytes to everyone else in the room.
    pub async fn handle_frame(&self, conn: &Arc<dyn Connection>, frame: Vec<u8>) {
        if conn.phase() == ConnectionPhase::Closed {
            return;
        }
        if frame.is_empty() {
            log::warn!("Ignoring empty frame from connection {}", conn.id());
            return;
        }

        let doc_id = conn.doc_id();
        match self.registry.apply_update(doc_id, &frame).await {
            Ok(()) => {
                self.stats.update_applied();
                self.audit.emit(&AuditEvent::UpdateApplied {
                    doc_id: doc_id.to_string(),
                    conn_id: conn.id(),
                    update_bytes: frame.len(),
                });

                let delivered = self
                    .rooms
                    .broadcast_except(doc_id, conn.id(), Arc::new(frame))
                    .await;
                self.stats.broadcast_delivered(delivered);
            }
            Err(MergeError::Malformed(e)) => {
                // Drop the update, keep the connection: one bad frame must
                // not take down an otherwise healthy peer.
                self.stats.update_rejected();
                log::warn!(
                    "Dropping malformed update from connection {} on doc {doc_id}: {e}",
                    conn.id()
                );
            }
        }
    }

    /// Tear down a connection after its transport closed or errored.
    /// Safe to call at most once per successful attach; repeated calls
    /// find no session and do nothing.
    pub async fn detach(&self, conn: &Arc<dyn Connection>) {
        let doc_id = conn.doc_id().to_string();
        conn.advance_phase(ConnectionPhase::Closed);

        let handle = match self.sessions.write().await.remove(&conn.id()) {
            Some(h) => h,
            None => return,
        };

        self.rooms.leave(&doc_id, conn.id()).await;
        // Releasing the registry reference flushes dirty state when this
        // was the last peer.
        self.registry.release(&handle).await;

        self.stats.connection_closed();
        self.audit.emit(&AuditEvent::ConnectionClosed {
            doc_id,
            conn_id: conn.id(),
        });
    }

    /// Administratively delete a document: close every connection, drop
    /// the registry entry, and issue a best-effort durable delete.
    ///
    /// Idempotent. Returns whether any in-memory or connection state
    /// existed before the call.
    pub async fn delete_document(&self, doc_id: &str) -> bool {
        let had_document = self.registry.is_loaded(doc_id).await;

        let connections_closed = self.rooms.close_all(doc_id, "document deleted").await;
        let removed = self.registry.delete(doc_id).await;

        // Durable deletion is best-effort: in-memory teardown already
        // happened and must not be rolled back by a storage failure.
        if let Err(e) = self.store.delete(doc_id).await {
            log::warn!("Durable delete failed for doc {doc_id} (continuing): {e}");
        }

        let existed = removed || connections_closed > 0;
        if existed {
            self.stats.document_deleted();
            log::info!(
                "Deleted document {doc_id} (had_document={had_document}, \
                 connections_closed={connections_closed})"
            );
        }
        self.audit.emit(&AuditEvent::DocumentDeleted {
            doc_id: doc_id.to_string(),
            had_document,
            connections_closed,
        });

        existed
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
