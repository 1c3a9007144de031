//! # atlas-collab — Real-time collaboration core for shared maps
//!
//! A map is a graph of notes and connections edited by several peers at
//! once. This crate is the synchronization core that makes that safe: it
//! holds the replicated state per document, fans each peer's updates out to
//! everyone else in the room, persists snapshots without blocking live
//! traffic, and tears everything down cleanly on disconnect or deletion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐     WebSocket      ┌────────────────────────────┐
//! │  Peer    │ ◄────────────────► │ SyncServer                 │
//! │ (editor) │   binary updates   │  └─ SyncEngine             │
//! └──────────┘                    │      ├─ DocumentRegistry ──┼──► SnapshotStore
//!                                 │      ├─ RoomManager        │     (RocksDB / memory)
//!                                 │      └─ AuditSink + stats  │
//!                                 └────────────────────────────┘
//! ```
//!
//! The engine is a relay, not a re-encoder: inbound frames are merged into
//! the authoritative state by a pluggable [`merge::MergeEngine`] (yrs by
//! default) and forwarded to the other room members byte-for-byte. A
//! joining peer receives the full merged state as its first message and is
//! caught up from there by the normal fan-out.
//!
//! ## Modules
//!
//! - [`merge`] — pluggable CRDT merge seam (yrs default)
//! - [`registry`] — in-memory document cache, debounced flush, idle eviction
//! - [`room`] — per-document connection sets and exclusive broadcast
//! - [`engine`] — join/relay/disconnect/delete orchestration
//! - [`connection`] — transport-agnostic connection trait and state machine
//! - [`storage`] — durable snapshot stores (RocksDB, in-memory)
//! - [`entity`] — versioned map entities with ETag optimistic concurrency
//! - [`audit`] — structured events and atomic counters
//! - [`server`] — the WebSocket front end
//!
//! ## Quick start
//!
//! ```no_run
//! use atlas_collab::server::{ServerConfig, SyncServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = SyncServer::new(ServerConfig {
//!         bind_addr: "127.0.0.1:9100".to_string(),
//!         storage_path: Some("atlas_data".into()),
//!         ..ServerConfig::default()
//!     })?;
//!     server.run().await
//! }
//! ```

pub mod audit;
pub mod connection;
pub mod engine;
pub mod entity;
pub mod merge;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditSink, LogAuditSink, NullAuditSink, StatsSnapshot, SyncStats};
pub use connection::{ConnId, Connection, ConnectionPhase, PhaseCell, SendError};
pub use engine::{SyncEngine, SyncError};
pub use entity::{EntityError, EntityStore, MapEntity, Precondition};
pub use merge::{MergeEngine, MergeError, YrsMerge};
pub use registry::{DocumentHandle, DocumentRegistry, RegistryConfig};
pub use room::RoomManager;
pub use server::{ServerConfig, SyncServer};
pub use storage::{
    MemorySnapshotStore, RocksSnapshotStore, SnapshotMetadata, SnapshotStore, StoreConfig,
    StoreError,
};
