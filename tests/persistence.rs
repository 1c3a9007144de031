//! Durability flows across the registry, engine, and stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use atlas_collab::audit::{NullAuditSink, SyncStats};
use atlas_collab::engine::SyncEngine;
use atlas_collab::merge::YrsMerge;
use atlas_collab::registry::{DocumentRegistry, RegistryConfig};
use atlas_collab::room::RoomManager;
use atlas_collab::storage::{
    MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError,
};
use yrs::updates::decoder::Decode;
use yrs::{GetString, ReadTxn, StateVector, Text, Update, WriteTxn};

fn note_update(content: &str) -> Vec<u8> {
    let doc = yrs::Doc::new();
    {
        let mut txn = yrs::Transact::transact_mut(&doc);
        let text = txn.get_or_insert_text("notes");
        text.insert(&mut txn, 0, content);
    }
    let txn = yrs::Transact::transact(&doc);
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn decode_notes(state: &[u8]) -> String {
    let doc = yrs::Doc::new();
    {
        let mut txn = yrs::Transact::transact_mut(&doc);
        txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
    }
    let txn = yrs::Transact::transact(&doc);
    match txn.get_text("notes") {
        Some(text) => text.get_string(&txn),
        None => String::new(),
    }
}

fn registry_over(store: Arc<dyn SnapshotStore>) -> Arc<DocumentRegistry> {
    Arc::new(DocumentRegistry::new(
        Arc::new(YrsMerge::new()),
        store,
        Arc::new(SyncStats::new()),
        Arc::new(NullAuditSink),
        RegistryConfig {
            flush_debounce: Duration::from_millis(10),
            idle_grace: Duration::from_secs(300),
        },
    ))
}

fn engine_over(store: Arc<dyn SnapshotStore>) -> SyncEngine {
    let stats = Arc::new(SyncStats::new());
    SyncEngine::new(
        registry_over(store.clone()),
        Arc::new(RoomManager::new()),
        store,
        Arc::new(NullAuditSink),
        stats,
        0,
    )
}

/// Memory-backed store whose `delete` always fails.
struct NoDeleteStore {
    inner: MemorySnapshotStore,
}

#[async_trait]
impl SnapshotStore for NoDeleteStore {
    async fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(doc_id).await
    }
    async fn save(&self, doc_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.inner.save(doc_id, snapshot).await
    }
    async fn delete(&self, _doc_id: &str) -> Result<(), StoreError> {
        Err(StoreError::DatabaseError("delete unavailable".into()))
    }
}

/// Memory-backed store that fails saves until healed.
struct FlakySaveStore {
    inner: MemorySnapshotStore,
    healthy: AtomicBool,
}

impl FlakySaveStore {
    fn new() -> Self {
        Self {
            inner: MemorySnapshotStore::new(),
            healthy: AtomicBool::new(false),
        }
    }

    fn heal(&self) {
        self.healthy.store(true, Ordering::Release);
    }
}

#[async_trait]
impl SnapshotStore for FlakySaveStore {
    async fn load(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(doc_id).await
    }
    async fn save(&self, doc_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        if !self.healthy.load(Ordering::Acquire) {
            return Err(StoreError::DatabaseError("save unavailable".into()));
        }
        self.inner.save(doc_id, snapshot).await
    }
    async fn delete(&self, doc_id: &str) -> Result<(), StoreError> {
        self.inner.delete(doc_id).await
    }
}

#[tokio::test]
async fn test_registry_state_survives_restart_over_rocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let store =
            Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(&path)).unwrap());
        let registry = registry_over(store);
        let handle = registry.checkout("atlas-1").await;
        registry
            .apply_update("atlas-1", &note_update("crash safe"))
            .await
            .unwrap();
        registry.release(&handle).await;
    }

    // Let the armed debounce task finish so the database lock is released.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A new registry over a reopened database sees the flushed state.
    let store = Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(&path)).unwrap());
    let registry = registry_over(store);
    let state = registry.full_state("atlas-1").await;
    assert_eq!(decode_notes(&state), "crash safe");
}

#[tokio::test]
async fn test_rocks_metadata_after_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let registry = registry_over(store.clone());

    for word in ["one ", "two "] {
        let handle = registry.checkout("atlas-2").await;
        registry.apply_update("atlas-2", &note_update(word)).await.unwrap();
        registry.release(&handle).await;
    }

    let meta = store.load_metadata("atlas-2").unwrap();
    assert_eq!(meta.doc_id, "atlas-2");
    assert!(meta.save_count >= 2);
    assert!(meta.snapshot_size > 0);
}

#[tokio::test]
async fn test_failed_durable_delete_does_not_block_teardown() {
    let store = Arc::new(NoDeleteStore {
        inner: MemorySnapshotStore::new(),
    });
    let engine = engine_over(store.clone());

    engine.registry().apply_update("m1", &note_update("x")).await.unwrap();
    assert!(engine.registry().is_loaded("m1").await);

    // The durable delete fails, but in-memory teardown still completes and
    // the call still reports that state existed.
    assert!(engine.delete_document("m1").await);
    assert!(!engine.registry().is_loaded("m1").await);
    assert!(!engine.delete_document("m1").await);
}

#[tokio::test]
async fn test_save_failure_retried_on_next_flush() {
    let store = Arc::new(FlakySaveStore::new());
    let registry = registry_over(store.clone());

    registry.apply_update("m1", &note_update("retry me")).await.unwrap();
    let handle = registry.get_or_create("m1").await;

    assert!(registry.flush(&handle).await.is_err());
    assert_eq!(store.inner.load("m1").await.unwrap(), None);

    store.heal();
    assert_eq!(registry.flush(&handle).await.unwrap(), true);
    let stored = store.inner.load("m1").await.unwrap().expect("saved on retry");
    assert_eq!(decode_notes(&stored), "retry me");

    // Nothing left to write.
    assert_eq!(registry.flush(&handle).await.unwrap(), false);
}

#[tokio::test]
async fn test_entity_records_survive_restart_over_rocks() {
    use atlas_collab::entity::{EntityStore, Precondition};
    use serde_json::json;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    let id = {
        let store =
            Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(&path)).unwrap());
        let entities = EntityStore::new(store);
        let created = entities
            .create(json!({"title": "atlas", "nodes": [{"id": 1}]}))
            .await
            .unwrap();
        entities
            .update(
                &created.id,
                json!({"title": "atlas v2", "nodes": [{"id": 1}]}),
                Precondition::Version(1),
            )
            .await
            .unwrap();
        created.id
    };

    let store = Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(&path)).unwrap());
    let entities = EntityStore::new(store);
    let loaded = entities.get(&id).await.unwrap().expect("record persisted");
    assert_eq!(loaded.version, 2);
    assert_eq!(loaded.data["title"], "atlas v2");
}

#[tokio::test]
async fn test_entity_keys_do_not_collide_with_snapshots() {
    let store = Arc::new(MemorySnapshotStore::new());
    let registry = registry_over(store.clone());
    let entities = atlas_collab::entity::EntityStore::new(store.clone());

    let entity = entities.create(serde_json::json!({"k": 1})).await.unwrap();
    let handle = registry.checkout(&entity.id).await;
    registry
        .apply_update(&entity.id, &note_update("same id, different space"))
        .await
        .unwrap();
    registry.release(&handle).await;

    // Both records live side by side under distinct keys.
    let fetched = entities.get(&entity.id).await.unwrap().unwrap();
    assert_eq!(fetched.version, 1);
    let snapshot = store.load(&entity.id).await.unwrap().expect("doc snapshot");
    assert_eq!(decode_notes(&snapshot), "same id, different space");
}
