//! Durable snapshot persistence for collaborative maps.
//!
//! The sync core treats storage as an async key-value collaborator:
//!
//! ```text
//! ┌──────────────┐   load / save / delete   ┌────────────────────┐
//! │ Registry     │ ───────────────────────► │ SnapshotStore      │
//! │ (in-memory)  │                          │  rocks  — RocksDB  │
//! └──────────────┘                          │  memory — HashMap  │
//!                                           └────────────────────┘
//! ```
//!
//! Failures are transient by contract: a failed `load` seeds an empty
//! document, a failed `save` is retried on the next flush, and a failed
//! `delete` never blocks in-memory teardown.

pub mod memory;
pub mod rocks;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, SnapshotMetadata, StoreConfig};

use async_trait::async_trait;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// No record for the given key
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(key) => write!(f, "Not found: {key}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable key-value persistence keyed by document id.
///
/// `load` distinguishes "absent" from failure: `Ok(None)` means the key has
/// never been saved (or was deleted), an `Err` means the backend itself
/// misbehaved. Absence is an answer, not an error.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn save(&self, doc_id: &str, snapshot: &[u8]) -> Result<(), StoreError>;

    async fn delete(&self, doc_id: &str) -> Result<(), StoreError>;
}
