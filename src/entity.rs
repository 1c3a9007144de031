//! Versioned map entities with optimistic concurrency.
//!
//! The REST-facing view of maps is independent of the CRDT relay: each
//! entity carries a monotonically increasing version and a content-derived
//! ETag, and writers must present one of them as a precondition. A mismatch
//! is a conflict, not an error, and leaves the entity unchanged.
//!
//! The ETag is a SHA-256 over a canonical JSON form (object keys sorted
//! recursively), so semantically identical payloads hash identically
//! regardless of property order. Records persist through the same
//! [`SnapshotStore`] the sync core uses, under a `map/` key namespace.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::storage::{SnapshotStore, StoreError};

/// Key prefix separating entity records from document snapshots.
const KEY_PREFIX: &str = "map/";

/// One versioned map entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapEntity {
    pub id: String,
    /// Monotonically increasing; 1 on creation.
    pub version: u64,
    /// Content hash of `data` in canonical form.
    pub etag: String,
    pub data: Value,
}

/// What a writer must present for an update to be accepted.
#[derive(Debug, Clone)]
pub enum Precondition {
    /// The expected current version number.
    Version(u64),
    /// An `If-Match` style token equal to the current ETag.
    ETag(String),
}

/// Entity store errors. `Conflict` maps to HTTP 409, `NotFound` to 404.
#[derive(Debug, Clone)]
pub enum EntityError {
    NotFound(String),
    Conflict {
        id: String,
        current_version: u64,
        current_etag: String,
    },
    Storage(StoreError),
    Serialization(String),
}

impl std::fmt::Display for EntityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityError::NotFound(id) => write!(f, "Entity not found: {id}"),
            EntityError::Conflict {
                id,
                current_version,
                ..
            } => write!(f, "Version conflict on {id} (current version {current_version})"),
            EntityError::Storage(e) => write!(f, "Storage error: {e}"),
            EntityError::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for EntityError {}

impl From<StoreError> for EntityError {
    fn from(e: StoreError) -> Self {
        EntityError::Storage(e)
    }
}

/// CRUD over versioned map entities, write-through to durable storage.
pub struct EntityStore {
    store: Arc<dyn SnapshotStore>,
    /// Write-through cache; the write lock serializes all mutations.
    entities: RwLock<HashMap<String, MapEntity>>,
}

impl EntityStore {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            entities: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new entity at version 1 with a generated id.
    pub async fn create(&self, data: Value) -> Result<MapEntity, EntityError> {
        let entity = MapEntity {
            id: Uuid::new_v4().to_string(),
            version: 1,
            etag: etag_for(&data)?,
            data,
        };

        self.persist(&entity).await?;
        self.entities
            .write()
            .await
            .insert(entity.id.clone(), entity.clone());
        log::info!("Created map entity {} (version 1)", entity.id);
        Ok(entity)
    }

    /// Fetch an entity, falling back to durable storage on a cache miss.
    pub async fn get(&self, id: &str) -> Result<Option<MapEntity>, EntityError> {
        if let Some(entity) = self.entities.read().await.get(id) {
            return Ok(Some(entity.clone()));
        }

        match self.load(id).await? {
            Some(entity) => {
                self.entities
                    .write()
                    .await
                    .insert(id.to_string(), entity.clone());
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Replace an entity's data, guarded by a version or ETag precondition.
    ///
    /// On success the version increments and the ETag is recomputed. On a
    /// stale precondition the entity is left exactly as it was and a
    /// `Conflict` carries the current version/ETag for the caller's retry.
    pub async fn update(
        &self,
        id: &str,
        data: Value,
        precondition: Precondition,
    ) -> Result<MapEntity, EntityError> {
        let mut entities = self.entities.write().await;

        let current = match entities.get(id) {
            Some(e) => e.clone(),
            None => match self.load(id).await? {
                Some(e) => e,
                None => return Err(EntityError::NotFound(id.to_string())),
            },
        };

        let matches = match &precondition {
            Precondition::Version(v) => *v == current.version,
            Precondition::ETag(tag) => *tag == current.etag,
        };
        if !matches {
            return Err(EntityError::Conflict {
                id: id.to_string(),
                current_version: current.version,
                current_etag: current.etag,
            });
        }

        let next = MapEntity {
            id: current.id,
            version: current.version + 1,
            etag: etag_for(&data)?,
            data,
        };

        // Persist first: a storage failure must not leave the cache ahead
        // of durable state.
        self.persist(&next).await?;
        entities.insert(id.to_string(), next.clone());
        log::debug!("Updated map entity {id} to version {}", next.version);
        Ok(next)
    }

    /// Delete an entity. Returns false if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool, EntityError> {
        let mut entities = self.entities.write().await;
        let existed = entities.remove(id).is_some() || self.load(id).await?.is_some();
        if existed {
            self.store.delete(&key_for(id)).await?;
            log::info!("Deleted map entity {id}");
        }
        Ok(existed)
    }

    async fn persist(&self, entity: &MapEntity) -> Result<(), EntityError> {
        let bytes = serde_json::to_vec(entity)
            .map_err(|e| EntityError::Serialization(e.to_string()))?;
        self.store.save(&key_for(&entity.id), &bytes).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<MapEntity>, EntityError> {
        match self.store.load(&key_for(id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| EntityError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}

fn key_for(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// SHA-256 of the canonical JSON form, hex-encoded.
fn etag_for(data: &Value) -> Result<String, EntityError> {
    let mut canonical = Vec::new();
    write_canonical(data, &mut canonical)?;

    let digest = Sha256::digest(&canonical);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

/// Serialize with object keys sorted recursively, so property order never
/// changes the hash.
fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), EntityError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String((*key).clone()), out)?;
                out.push(b':');
                match map.get(*key) {
                    Some(v) => write_canonical(v, out)?,
                    None => out.extend_from_slice(b"null"),
                }
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out)?,
    }
    Ok(())
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) -> Result<(), EntityError> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| EntityError::Serialization(e.to_string()))?;
    out.extend_from_slice(&bytes);
    Ok(())
}
