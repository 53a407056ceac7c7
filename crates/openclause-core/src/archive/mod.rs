//! Incremental verified archiving of evidence chains to object storage.
//!
//! Per tenant, the archiver reads its checkpoint, fetches the events
//! appended since, verifies the chain window against the checkpointed
//! hash, bundles the window as canonical JSON, uploads it under a key
//! derived from the window's own checkpoint hash, and only then advances
//! the checkpoint. Because the key is content-derived, an identical
//! re-run overwrites the same object — idempotent on blob storage.

mod s3;

pub use s3::S3ObjectStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::{canonical_json, CanonicalError};
use crate::chain::{verify_chain_from, ChainError, ChainEvent};
use crate::evidence::{EvidenceError, EvidenceStore};

/// Errors raised during an archive pass.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Evidence store failure.
    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    /// The chain window failed verification; nothing is uploaded.
    #[error("verify chain: {0}")]
    Chain(#[from] ChainError),

    /// Bundle serialization failure.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// Object storage failure.
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

/// Errors from an object-store backend.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// Filesystem failure.
    #[error("object store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The upload could not be sent.
    #[error("object store transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// The store answered with a non-2xx status.
    #[error("object store returned {status}: {snippet}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Bounded body snippet.
        snippet: String,
    },
}

/// Where evidence bundles are uploaded.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `body` under `key`, overwriting any prior object.
    ///
    /// # Errors
    ///
    /// Returns an error when the object could not be stored.
    async fn put(&self, key: &str, body: &[u8], content_type: &str)
        -> Result<(), ObjectStoreError>;
}

/// Filesystem-backed object store for tests and single-node deployments.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        body: &[u8],
        _content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, body)?;
        Ok(())
    }
}

/// One uploaded archive window.
#[derive(Debug, Serialize, Deserialize)]
pub struct Bundle {
    /// Tenant the window belongs to.
    pub tenant_id: String,
    /// When the bundle was built.
    pub created_at: DateTime<Utc>,
    /// Number of chain records in the window.
    pub event_count: usize,
    /// Hash of the last event in the window; also names the object.
    pub checkpoint_hash: String,
    /// Prior checkpoint time (start of the window).
    pub since: DateTime<Utc>,
    /// Receipt time of the last event in the window.
    pub until: DateTime<Utc>,
    /// The verified chain records.
    pub chain_records: Vec<ChainEvent>,
}

/// Archives evidence chains tenant by tenant.
pub struct Archiver {
    store: EvidenceStore,
    uploader: Arc<dyn ObjectStore>,
}

impl Archiver {
    /// Creates an archiver over the given store and uploader.
    #[must_use]
    pub fn new(store: EvidenceStore, uploader: Arc<dyn ObjectStore>) -> Self {
        Self { store, uploader }
    }

    /// Runs one archive pass for a tenant. Returns the uploaded object
    /// key, or `None` when the chain has not advanced past the
    /// checkpoint.
    ///
    /// The checkpoint only advances after a successful upload, so a
    /// failed pass re-archives the same window next time.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure, chain verification failure,
    /// or upload failure.
    pub async fn archive_tenant(&self, tenant_id: &str) -> Result<Option<String>, ArchiveError> {
        let (since, last_hash, last_seq) = self.store.get_archive_checkpoint(tenant_id)?;
        let events = self.store.get_chain_events(tenant_id, last_seq)?;
        if events.is_empty() {
            return Ok(None);
        }
        verify_chain_from(&last_hash, &events)?;

        let Some(last) = events.last() else {
            return Ok(None);
        };
        let checkpoint_hash = last.hash.clone();
        let checkpoint_at = last.received_at;
        let checkpoint_seq = last.event_seq;
        let now = Utc::now();

        let bundle = Bundle {
            tenant_id: tenant_id.to_string(),
            created_at: now,
            event_count: events.len(),
            checkpoint_hash: checkpoint_hash.clone(),
            since,
            until: checkpoint_at,
            chain_records: events,
        };
        let body = canonical_json(&bundle)?;

        let key = format!(
            "evidence/{tenant_id}/{:04}/{:02}/{:02}/{checkpoint_hash}.json",
            now.year(),
            now.month(),
            now.day(),
        );
        self.uploader.put(&key, &body, "application/json").await?;

        self.store
            .upsert_archive_checkpoint(tenant_id, checkpoint_at, &checkpoint_hash, checkpoint_seq)?;
        Ok(Some(key))
    }

    /// Archives every tenant (or just `only_tenant` when non-empty),
    /// logging per-tenant outcomes. Failures on one tenant do not stop
    /// the pass.
    ///
    /// # Errors
    ///
    /// Returns an error only when the tenant listing itself fails.
    pub async fn run_pass(&self, only_tenant: &str) -> Result<(), ArchiveError> {
        let tenants = if only_tenant.is_empty() {
            self.store.list_tenant_ids()?
        } else {
            vec![only_tenant.to_string()]
        };
        for tenant_id in tenants {
            match self.archive_tenant(&tenant_id).await {
                Ok(Some(key)) => {
                    tracing::info!(tenant_id = %tenant_id, key = %key, "archived evidence bundle");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(tenant_id = %tenant_id, error = %e, "archive tenant failed");
                }
            }
        }
        Ok(())
    }
}
