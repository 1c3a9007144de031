//! In-memory snapshot store.
//!
//! Backs storage-less servers and tests. Same contract as the RocksDB
//! store; contents vanish with the process.

use std::collections::HashMap;
use tokio::sync::RwLock;

use async_trait::async_trait;

use super::{SnapshotStore, StoreError};

/// HashMap-backed snapshot store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshots.read().await.get(doc_id).cloned())
    }

    async fn save(&self, doc_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(doc_id.to_string(), snapshot.to_vec());
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<(), StoreError> {
        self.snapshots.write().await.remove(doc_id);
        Ok(())
    }
}
