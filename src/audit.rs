//! Structured audit events and lock-free server counters.
//!
//! Every lifecycle transition in the sync core emits an [`AuditEvent`] to a
//! fire-and-forget [`AuditSink`]. Sinks must never block or fail the calling
//! operation; the default [`LogAuditSink`] forwards to the `log` facade.
//!
//! Counters are tracked via atomics so the hot paths (merge, fan-out) never
//! acquire a lock for bookkeeping. Read them via [`SyncStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::ConnId;

/// A structured observability event emitted by the sync core.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// A document was seeded empty (no durable snapshot existed).
    DocumentCreated { doc_id: String },
    /// A document was administratively deleted, with counts captured
    /// before teardown began.
    DocumentDeleted {
        doc_id: String,
        had_document: bool,
        connections_closed: usize,
    },
    /// An inbound update was merged and relayed.
    UpdateApplied {
        doc_id: String,
        conn_id: ConnId,
        update_bytes: usize,
    },
    /// A peer finished joining a document.
    ConnectionOpened { doc_id: String, conn_id: ConnId },
    /// A peer left (disconnect, error, or forced close).
    ConnectionClosed { doc_id: String, conn_id: ConnId },
}

/// Receiver for audit events. Emission is fire-and-forget: implementations
/// must not block and must not propagate failures to the caller.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Default sink: forwards events to the `log` facade.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn emit(&self, event: &AuditEvent) {
        match event {
            AuditEvent::DocumentCreated { doc_id } => {
                log::info!("audit: document_created doc={doc_id}");
            }
            AuditEvent::DocumentDeleted {
                doc_id,
                had_document,
                connections_closed,
            } => {
                log::info!(
                    "audit: document_deleted doc={doc_id} had_document={had_document} \
                     connections_closed={connections_closed}"
                );
            }
            AuditEvent::UpdateApplied {
                doc_id,
                conn_id,
                update_bytes,
            } => {
                log::trace!("audit: update_applied doc={doc_id} conn={conn_id} bytes={update_bytes}");
            }
            AuditEvent::ConnectionOpened { doc_id, conn_id } => {
                log::debug!("audit: connection_opened doc={doc_id} conn={conn_id}");
            }
            AuditEvent::ConnectionClosed { doc_id, conn_id } => {
                log::debug!("audit: connection_closed doc={doc_id} conn={conn_id}");
            }
        }
    }
}

/// Sink that discards every event. Useful for embedding and tests.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn emit(&self, _event: &AuditEvent) {}
}

/// Server-wide counters, lock-free on the hot path.
#[derive(Default)]
pub struct SyncStats {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    updates_applied: AtomicU64,
    updates_rejected: AtomicU64,
    broadcast_deliveries: AtomicU64,
    documents_created: AtomicU64,
    documents_deleted: AtomicU64,
    snapshot_flushes: AtomicU64,
    flush_failures: AtomicU64,
}

/// Plain-value view of [`SyncStats`] at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub updates_applied: u64,
    pub updates_rejected: u64,
    pub broadcast_deliveries: u64,
    pub documents_created: u64,
    pub documents_deleted: u64,
    pub snapshot_flushes: u64,
    pub flush_failures: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_applied(&self) {
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_rejected(&self) {
        self.updates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_delivered(&self, receivers: usize) {
        self.broadcast_deliveries
            .fetch_add(receivers as u64, Ordering::Relaxed);
    }

    pub fn document_created(&self) {
        self.documents_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn document_deleted(&self) {
        self.documents_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_flushed(&self) {
        self.snapshot_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_failed(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters at once.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            updates_rejected: self.updates_rejected.load(Ordering::Relaxed),
            broadcast_deliveries: self.broadcast_deliveries.load(Ordering::Relaxed),
            documents_created: self.documents_created.load(Ordering::Relaxed),
            documents_deleted: self.documents_deleted.load(Ordering::Relaxed),
            snapshot_flushes: self.snapshot_flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}
