//! In-memory document registry: the single source of truth for which maps
//! are loaded and what their merged state is.
//!
//! Each loaded document is an opaque state blob guarded by its own async
//! mutex, so merges for one document are serialized while documents stay
//! fully parallel to each other. The outer map uses double-checked locking
//! (read, then write with a re-check) so concurrent joiners for the same id
//! always share one handle and exactly one of them seeds it from storage.
//!
//! Persistence is write-behind: updates mark the document dirty and arm a
//! debounced flush so a burst of edits produces one snapshot save. The last
//! disconnect flushes immediately, and a document idle past the configured
//! grace period is flushed and evicted to bound memory; it reloads
//! transparently on the next access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::audit::{AuditEvent, AuditSink, SyncStats};
use crate::merge::{MergeEngine, MergeError};
use crate::storage::{SnapshotStore, StoreError};

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Delay between the first dirtying update and its snapshot flush.
    pub flush_debounce: Duration,
    /// How long a document with zero connections stays resident.
    pub idle_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            flush_debounce: Duration::from_millis(500),
            idle_grace: Duration::from_secs(300),
        }
    }
}

/// Mutable document state, always accessed through the handle's mutex.
struct Document {
    /// Merged state blob, owned by the merge engine's encoding.
    state: Vec<u8>,
    /// True when the state has changes not yet persisted.
    dirty: bool,
    /// True once the initial load-or-seed completed.
    loaded: bool,
}

/// Shared handle to one loaded document.
pub struct DocumentHandle {
    doc_id: String,
    doc: Mutex<Document>,
    /// Number of live connections referencing this document.
    connections: AtomicUsize,
    /// True while a debounced flush task is armed.
    flush_queued: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl DocumentHandle {
    fn new(doc_id: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            doc: Mutex::new(Document {
                state: Vec::new(),
                dirty: false,
                loaded: false,
            }),
            connections: AtomicUsize::new(0),
            flush_queued: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }
}

/// Registry of live documents, keyed by opaque document id.
pub struct DocumentRegistry {
    docs: RwLock<HashMap<String, Arc<DocumentHandle>>>,
    merge: Arc<dyn MergeEngine>,
    store: Arc<dyn SnapshotStore>,
    stats: Arc<SyncStats>,
    audit: Arc<dyn AuditSink>,
    config: RegistryConfig,
}

impl DocumentRegistry {
    pub fn new(
        merge: Arc<dyn MergeEngine>,
        store: Arc<dyn SnapshotStore>,
        stats: Arc<SyncStats>,
        audit: Arc<dyn AuditSink>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            merge,
            store,
            stats,
            audit,
            config,
        }
    }

    /// Get the document, loading it from storage or seeding it empty.
    pub async fn get_or_create(self: &Arc<Self>, doc_id: &str) -> Arc<DocumentHandle> {
        let handle = self.handle_for(doc_id).await;
        self.ensure_loaded(&handle).await;
        handle
    }

    /// Get the document and take a connection reference in one step.
    ///
    /// The reference count is bumped while the registry map lock is held,
    /// so idle eviction can never race a joining peer. Pair every checkout
    /// with exactly one [`release`](Self::release).
    pub async fn checkout(self: &Arc<Self>, doc_id: &str) -> Arc<DocumentHandle> {
        let existing = {
            let docs = self.docs.read().await;
            docs.get(doc_id).map(|h| {
                h.connections.fetch_add(1, Ordering::AcqRel);
                h.clone()
            })
        };

        let handle = match existing {
            Some(h) => h,
            None => {
                let mut docs = self.docs.write().await;
                let h = docs
                    .entry(doc_id.to_string())
                    .or_insert_with(|| Arc::new(DocumentHandle::new(doc_id)))
                    .clone();
                h.connections.fetch_add(1, Ordering::AcqRel);
                h
            }
        };

        self.ensure_loaded(&handle).await;
        handle.touch().await;
        handle
    }

    /// Drop one connection reference taken by [`checkout`](Self::checkout).
    /// When the last one goes, dirty state is flushed immediately and
    /// eviction is armed for the grace period.
    ///
    /// Takes the handle rather than the id so that a release racing a
    /// delete-and-recreate of the same id can never touch the new
    /// document's count.
    pub async fn release(self: &Arc<Self>, handle: &Arc<DocumentHandle>) {
        handle.touch().await;

        let prev = handle
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        let remaining = match prev {
            Ok(p) => p - 1,
            Err(_) => 0,
        };
        if remaining > 0 {
            return;
        }

        // A handle no longer in the map was deleted; persisting it now
        // would resurrect the durable snapshot.
        if !self.is_current(handle).await {
            return;
        }

        let _ = self.flush(handle).await;

        // The timer holds only a weak reference: dropping the registry
        // (server shutdown) must release the store immediately.
        let registry = Arc::downgrade(self);
        let handle = handle.clone();
        let grace = self.config.idle_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                registry.evict_if_idle(&handle).await;
            }
        });
    }

    /// Merge `update` into the document's state.
    ///
    /// A malformed update is rejected without touching the state and
    /// without closing anything; the caller decides how loudly to log.
    /// A successful merge marks the document dirty and arms the debounced
    /// flush.
    pub async fn apply_update(
        self: &Arc<Self>,
        doc_id: &str,
        update: &[u8],
    ) -> Result<(), MergeError> {
        let handle = self.get_or_create(doc_id).await;
        {
            let mut doc = handle.doc.lock().await;
            let merged = self.merge.merge(&doc.state, update)?;
            doc.state = merged;
            doc.dirty = true;
        }
        handle.touch().await;
        self.schedule_flush(&handle);
        Ok(())
    }

    /// Encode the full current state as the initial-sync payload.
    ///
    /// Taken under the document's merge lock, so a concurrent update is
    /// either fully included or not included at all.
    pub async fn full_state(self: &Arc<Self>, doc_id: &str) -> Vec<u8> {
        let handle = self.get_or_create(doc_id).await;
        self.full_state_of(&handle).await
    }

    /// Same as [`full_state`](Self::full_state), for an already-held handle.
    pub async fn full_state_of(&self, handle: &Arc<DocumentHandle>) -> Vec<u8> {
        let doc = handle.doc.lock().await;
        self.merge.encode_full_state(&doc.state)
    }

    /// Remove the document from the registry. Returns false if it was not
    /// loaded. Side effects (closing connections, durable deletion) belong
    /// to the sync engine.
    pub async fn delete(&self, doc_id: &str) -> bool {
        self.docs.write().await.remove(doc_id).is_some()
    }

    pub async fn is_loaded(&self, doc_id: &str) -> bool {
        self.docs.read().await.contains_key(doc_id)
    }

    pub async fn loaded_count(&self) -> usize {
        self.docs.read().await.len()
    }

    /// Ids of all currently loaded documents.
    pub async fn loaded_documents(&self) -> Vec<String> {
        self.docs.read().await.keys().cloned().collect()
    }

    /// Persist the document's state if dirty. Returns whether a save
    /// happened. On save failure the document is re-marked dirty so the
    /// next flush retries.
    pub async fn flush(&self, handle: &Arc<DocumentHandle>) -> Result<bool, StoreError> {
        // A debounced flush may fire after the document was deleted;
        // saving then would resurrect the durable snapshot.
        if !self.is_current(handle).await {
            return Ok(false);
        }
        let snapshot = {
            let mut doc = handle.doc.lock().await;
            if !doc.dirty {
                return Ok(false);
            }
            doc.dirty = false;
            doc.state.clone()
        };

        match self.store.save(&handle.doc_id, &snapshot).await {
            Ok(()) => {
                self.stats.snapshot_flushed();
                log::debug!(
                    "Flushed snapshot for doc {} ({} bytes)",
                    handle.doc_id,
                    snapshot.len()
                );
                Ok(true)
            }
            Err(e) => {
                handle.doc.lock().await.dirty = true;
                self.stats.flush_failed();
                log::error!("Snapshot save failed for doc {}: {e}", handle.doc_id);
                Err(e)
            }
        }
    }

    // ─── Internals ────────────────────────────────────────────────────

    async fn is_current(&self, handle: &Arc<DocumentHandle>) -> bool {
        self.docs
            .read()
            .await
            .get(&handle.doc_id)
            .map_or(false, |current| Arc::ptr_eq(current, handle))
    }

    async fn handle_for(&self, doc_id: &str) -> Arc<DocumentHandle> {
        {
            let docs = self.docs.read().await;
            if let Some(h) = docs.get(doc_id) {
                return h.clone();
            }
        }

        let mut docs = self.docs.write().await;
        // Double-check after acquiring the write lock.
        if let Some(h) = docs.get(doc_id) {
            return h.clone();
        }
        let handle = Arc::new(DocumentHandle::new(doc_id));
        docs.insert(doc_id.to_string(), handle.clone());
        handle
    }

    /// Seed a freshly-inserted handle, exactly once, under its own lock.
    async fn ensure_loaded(&self, handle: &Arc<DocumentHandle>) {
        let mut doc = handle.doc.lock().await;
        if doc.loaded {
            return;
        }

        match self.store.load(&handle.doc_id).await {
            Ok(Some(snapshot)) => match self.merge.load_state(&snapshot) {
                Ok(state) => {
                    log::debug!(
                        "Loaded snapshot for doc {} ({} bytes)",
                        handle.doc_id,
                        state.len()
                    );
                    doc.state = state;
                }
                Err(e) => {
                    log::warn!(
                        "Stored snapshot for doc {} is unreadable, seeding empty: {e}",
                        handle.doc_id
                    );
                    doc.state = self.merge.empty_state();
                }
            },
            Ok(None) => {
                doc.state = self.merge.empty_state();
                self.stats.document_created();
                self.audit.emit(&AuditEvent::DocumentCreated {
                    doc_id: handle.doc_id.clone(),
                });
                log::info!("Created document {}", handle.doc_id);
            }
            Err(e) => {
                log::warn!(
                    "Snapshot load failed for doc {}, treating as new: {e}",
                    handle.doc_id
                );
                doc.state = self.merge.empty_state();
            }
        }
        doc.loaded = true;
    }

    /// Arm one debounced flush per document; later updates within the
    /// window ride on the already-armed task.
    fn schedule_flush(self: &Arc<Self>, handle: &Arc<DocumentHandle>) {
        if handle.flush_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let registry = Arc::downgrade(self);
        let handle = handle.clone();
        let delay = self.config.flush_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.flush_queued.store(false, Ordering::Release);
            if let Some(registry) = registry.upgrade() {
                let _ = registry.flush(&handle).await;
            }
        });
    }

    async fn evict_if_idle(&self, handle: &Arc<DocumentHandle>) {
        if handle.connections.load(Ordering::Acquire) > 0 {
            return;
        }
        if handle.last_activity.lock().await.elapsed() < self.config.idle_grace {
            return;
        }
        // Never drop unpersisted state.
        if self.flush(handle).await.is_err() {
            return;
        }

        let mut docs = self.docs.write().await;
        let current = match docs.get(&handle.doc_id) {
            Some(c) => c,
            None => return,
        };
        if !Arc::ptr_eq(current, handle) {
            return;
        }
        // Checkouts bump the count under the map lock, so this re-check is
        // authoritative.
        if handle.connections.load(Ordering::Acquire) > 0 {
            return;
        }
        {
            let doc = handle.doc.lock().await;
            if doc.dirty {
                // An update raced the flush above; stay resident until the
                // next release cycle.
                return;
            }
        }
        docs.remove(&handle.doc_id);
        log::info!("Evicted idle document {}", handle.doc_id);
    }
}
