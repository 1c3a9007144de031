//! Room membership and exclusive fan-out.
//!
//! A room is the set of live connections subscribed to one document.
//! Rooms are created lazily on first join and pruned when the last member
//! leaves; the document itself may stay resident in the registry so that a
//! reconnecting peer skips the storage reload.
//!
//! Broadcast snapshots the membership under a read lock and sends outside
//! it, so joins and leaves never block a fan-out in progress. A peer that
//! joins mid-broadcast simply misses that already-completed message; its
//! initial state sync covers the content. Sends to all peers run
//! concurrently, and a peer whose send fails is closed and dropped from the
//! room without disturbing delivery to the rest.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use futures_util::future::join_all;

use crate::connection::{ConnId, Connection};

/// Per-document connection sets.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, HashMap<ConnId, Arc<dyn Connection>>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection to the room for its document, creating the room if
    /// absent. A connection belongs to at most one room; joining twice with
    /// the same id just replaces the handle.
    pub async fn join(&self, conn: Arc<dyn Connection>) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(conn.doc_id().to_string())
            .or_default()
            .insert(conn.id(), conn.clone());
        log::debug!("Connection {} joined room {}", conn.id(), conn.doc_id());
    }

    /// Remove a connection from a room. Empty rooms are pruned. Returns
    /// whether the connection was a member.
    pub async fn leave(&self, doc_id: &str, conn_id: ConnId) -> bool {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get_mut(doc_id) {
            Some(r) => r,
            None => return false,
        };
        let removed = room.remove(&conn_id).is_some();
        if removed {
            log::debug!("Connection {conn_id} left room {doc_id}");
        }
        if room.is_empty() {
            rooms.remove(doc_id);
            log::debug!("Room {doc_id} removed (empty)");
        }
        removed
    }

    /// Send `payload` verbatim to every room member except `sender`.
    ///
    /// Sends run concurrently; a failed send closes and evicts that one
    /// connection while the rest still get the message. Returns the number
    /// of successful deliveries.
    pub async fn broadcast_except(
        &self,
        doc_id: &str,
        sender: ConnId,
        payload: Arc<Vec<u8>>,
    ) -> usize {
        let targets: Vec<Arc<dyn Connection>> = {
            let rooms = self.rooms.read().await;
            match rooms.get(doc_id) {
                Some(room) => room
                    .values()
                    .filter(|c| c.id() != sender)
                    .cloned()
                    .collect(),
                None => return 0,
            }
        };

        let sends = targets.iter().map(|conn| {
            let payload = payload.clone();
            async move { conn.send(payload).await.map_err(|_| conn.id()) }
        });

        let mut delivered = 0;
        let mut failed = Vec::new();
        for result in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(conn_id) => failed.push(conn_id),
            }
        }

        for conn_id in failed {
            log::warn!("Dropping connection {conn_id} from room {doc_id}: send failed");
            if let Some(conn) = self.member(doc_id, conn_id).await {
                conn.close("send failed").await;
            }
            self.leave(doc_id, conn_id).await;
        }

        delivered
    }

    /// Forcibly close every connection in the room. Used by document
    /// deletion only. Returns how many connections were closed.
    pub async fn close_all(&self, doc_id: &str, reason: &str) -> usize {
        let room = { self.rooms.write().await.remove(doc_id) };
        let members = match room {
            Some(m) => m,
            None => return 0,
        };

        let count = members.len();
        for conn in members.into_values() {
            conn.close(reason).await;
        }
        if count > 0 {
            log::info!("Closed {count} connections in room {doc_id}: {reason}");
        }
        count
    }

    pub async fn connection_count(&self, doc_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(doc_id)
            .map_or(0, |room| room.len())
    }

    pub async fn has_room(&self, doc_id: &str) -> bool {
        self.rooms.read().await.contains_key(doc_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of all documents with at least one live connection.
    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    async fn member(&self, doc_id: &str, conn_id: ConnId) -> Option<Arc<dyn Connection>> {
        self.rooms
            .read()
            .await
            .get(doc_id)
            .and_then(|room| room.get(&conn_id).cloned())
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
