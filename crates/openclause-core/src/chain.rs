//! Per-tenant hash chain over canonical evidence bytes.
//!
//! Each event's hash commits to the previous hash, the canonical request
//! payload, and (when present) the canonical execution result. Every field
//! is length-prefixed with an 8-byte big-endian count before hashing, so
//! adjacent fields cannot be reinterpreted across a boundary
//! (`hash("ab","cd") != hash("a","bcd")`), and a leading version tag keeps
//! the scheme upgradable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain-separation tag mixed into every chain hash.
pub const CHAIN_DOMAIN_TAG: &str = "openclause:chain:v1";

/// A chain-verification failure, pinpointing the breaking index.
#[derive(Debug, Error)]
pub enum ChainError {
    /// An event's `prev_hash` does not match the prior event's hash.
    #[error("chain broken at index {index} (event {event_id}): expected prev_hash {expected}, got {got}")]
    PrevHashMismatch {
        /// Zero-based index into the verified window.
        index: usize,
        /// The offending event id.
        event_id: String,
        /// The hash the chain required.
        expected: String,
        /// The hash the event recorded.
        got: String,
    },

    /// An event's stored hash does not match the recomputed value.
    #[error("chain broken at index {index} (event {event_id}): expected {expected}, got {got}")]
    HashMismatch {
        /// Zero-based index into the verified window.
        index: usize,
        /// The offending event id.
        event_id: String,
        /// The recomputed hash.
        expected: String,
        /// The hash the event recorded.
        got: String,
    },
}

impl ChainError {
    /// The index at which verification failed.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::PrevHashMismatch { index, .. } | Self::HashMismatch { index, .. } => *index,
        }
    }
}

/// The minimal event shape needed for verification and archiving.
///
/// Canonical bytes are carried as UTF-8 strings; canonical JSON is always
/// valid UTF-8 and string storage keeps the archive bundles readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Store-assigned sequence number.
    pub event_seq: i64,
    /// Event identifier.
    pub event_id: String,
    /// Hash of the previous event, empty at the chain head.
    pub prev_hash: String,
    /// This event's hash.
    pub hash: String,
    /// Canonical request payload bytes.
    pub canon_payload: String,
    /// Canonical execution result bytes, when a result was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canon_result: Option<String>,
    /// When the gateway accepted the event.
    pub received_at: DateTime<Utc>,
}

/// Computes the next hash in a tenant's chain.
#[must_use]
pub fn chain_hash(prev_hash: &str, canon_payload: &[u8], canon_result: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, CHAIN_DOMAIN_TAG.as_bytes());
    write_field(&mut hasher, prev_hash.as_bytes());
    write_field(&mut hasher, canon_payload);
    if let Some(result) = canon_result {
        write_field(&mut hasher, result);
    }
    hex::encode(hasher.finalize())
}

fn write_field(hasher: &mut Sha256, data: &[u8]) {
    hasher.update((data.len() as u64).to_be_bytes());
    hasher.update(data);
}

/// Verifies a full chain starting from the empty head.
///
/// # Errors
///
/// Returns the first [`ChainError`] encountered, citing the breaking index.
pub fn verify_chain(events: &[ChainEvent]) -> Result<(), ChainError> {
    verify_chain_from("", events)
}

/// Verifies a chain window starting from a known previous hash.
///
/// Both linkage (`prev_hash[k] == hash[k-1]`) and content (recomputed
/// hashes) are checked for every event in order.
///
/// # Errors
///
/// Returns the first [`ChainError`] encountered, citing the breaking index.
pub fn verify_chain_from(prev: &str, events: &[ChainEvent]) -> Result<(), ChainError> {
    let mut prev = prev.to_string();
    for (index, event) in events.iter().enumerate() {
        if event.prev_hash != prev {
            return Err(ChainError::PrevHashMismatch {
                index,
                event_id: event.event_id.clone(),
                expected: prev,
                got: event.prev_hash.clone(),
            });
        }
        let expected = chain_hash(
            &prev,
            event.canon_payload.as_bytes(),
            event.canon_result.as_deref().map(str::as_bytes),
        );
        if event.hash != expected {
            return Err(ChainError::HashMismatch {
                index,
                event_id: event.event_id.clone(),
                expected,
                got: event.hash.clone(),
            });
        }
        prev = event.hash.clone();
    }
    Ok(())
}
