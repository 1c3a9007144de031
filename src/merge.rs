//! Pluggable CRDT merge seam.
//!
//! The registry never interprets map state itself. It holds an opaque byte
//! blob and delegates every mutation to a [`MergeEngine`], which must be
//! commutative, associative, and idempotent over well-formed updates. The
//! default engine is [`YrsMerge`], backed by the `yrs` CRDT library; the
//! state blob is the yrs v1 full-state update encoding.
//!
//! A malformed update must be detectable without touching the current state.
//! `YrsMerge` guarantees this by replaying into a scratch document: decode
//! errors surface before the caller's blob is replaced.

use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Update};

/// Errors surfaced by a merge engine.
#[derive(Debug, Clone)]
pub enum MergeError {
    /// The update (or a stored snapshot) could not be interpreted.
    Malformed(String),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::Malformed(e) => write!(f, "Malformed update: {e}"),
        }
    }
}

impl std::error::Error for MergeError {}

/// Commutative merge over opaque state and update blobs.
///
/// Implementations must be pure: `merge` either returns a new state or an
/// error, and never leaves a partially-mutated result.
pub trait MergeEngine: Send + Sync {
    /// Canonical encoding of an empty document.
    fn empty_state(&self) -> Vec<u8>;

    /// Merge `update` into `state`, returning the new state.
    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>, MergeError>;

    /// Encode the full state as the initial-sync payload for a new peer.
    fn encode_full_state(&self, state: &[u8]) -> Vec<u8> {
        state.to_vec()
    }

    /// Validate and canonicalize a snapshot loaded from durable storage.
    fn load_state(&self, snapshot: &[u8]) -> Result<Vec<u8>, MergeError> {
        self.merge(&[], snapshot)
    }
}

/// Yrs-backed merge engine.
///
/// State blobs are yrs v1 updates covering the whole document
/// (`encode_state_as_update_v1` against the empty state vector), so a
/// state blob is itself a valid update and the initial-sync payload needs
/// no re-encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct YrsMerge;

impl YrsMerge {
    pub fn new() -> Self {
        Self
    }
}

impl MergeEngine for YrsMerge {
    fn empty_state(&self) -> Vec<u8> {
        let doc = yrs::Doc::new();
        let txn = yrs::Transact::transact(&doc);
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>, MergeError> {
        // Decode before applying anything so garbage never reaches the doc.
        let decoded_update =
            Update::decode_v1(update).map_err(|e| MergeError::Malformed(e.to_string()))?;
        let decoded_state = if state.is_empty() {
            None
        } else {
            Some(Update::decode_v1(state).map_err(|e| MergeError::Malformed(e.to_string()))?)
        };

        let doc = yrs::Doc::new();
        {
            let mut txn = yrs::Transact::transact_mut(&doc);
            if let Some(base) = decoded_state {
                txn.apply_update(base)
                    .map_err(|e| MergeError::Malformed(e.to_string()))?;
            }
            txn.apply_update(decoded_update)
                .map_err(|e| MergeError::Malformed(e.to_string()))?;
        }

        let txn = yrs::Transact::transact(&doc);
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }
}
