//! Transport-agnostic connection handles.
//!
//! The sync engine never touches a WebSocket directly. It drives any
//! [`Connection`]: a live bidirectional channel tagged with the one document
//! id it serves, resolved at handshake time and immutable thereafter.
//!
//! Each connection moves through a one-way state machine:
//!
//! ```text
//! Connecting ──► Syncing ──► Active ──► Closed (terminal)
//! ```
//!
//! `Connecting` ends once the document is resolved and the peer has joined
//! its room. `Syncing` is the instant the initial state snapshot is sent.
//! `Closed` is irreversible; a closed connection is never reused.

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

/// Unique identifier for one live connection.
pub type ConnId = Uuid;

/// Protocol phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionPhase {
    Connecting = 0,
    Syncing = 1,
    Active = 2,
    Closed = 3,
}

impl ConnectionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionPhase::Connecting,
            1 => ConnectionPhase::Syncing,
            2 => ConnectionPhase::Active,
            _ => ConnectionPhase::Closed,
        }
    }
}

/// Atomic phase holder enforcing forward-only transitions.
///
/// Transitions may only move to a strictly later phase; once `Closed`,
/// every further transition is refused.
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionPhase::Connecting as u8))
    }

    pub fn get(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempt to move to `target`. Returns true if the phase changed.
    pub fn advance(&self, target: ConnectionPhase) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= target as u8 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.get() == ConnectionPhase::Closed
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Error delivering a frame to a peer.
#[derive(Debug, Clone)]
pub enum SendError {
    /// The connection (or its outbound channel) is gone.
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// A live bidirectional channel to exactly one peer.
///
/// `send` failures are soft: they report the peer as gone and must never
/// panic or abort unrelated traffic. `close` is immediate and
/// unconditional; it advances the phase to `Closed` and a best-effort
/// close frame is delivered to the transport.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnId;

    /// The document this connection serves, fixed at handshake.
    fn doc_id(&self) -> &str;

    fn phase(&self) -> ConnectionPhase;

    /// Forward-only phase transition. Returns true if the phase changed.
    fn advance_phase(&self, target: ConnectionPhase) -> bool;

    fn is_open(&self) -> bool {
        self.phase() != ConnectionPhase::Closed
    }

    /// Deliver one opaque binary frame to the peer.
    async fn send(&self, frame: std::sync::Arc<Vec<u8>>) -> Result<(), SendError>;

    /// Close the connection with a human-readable reason.
    async fn close(&self, reason: &str);
}
