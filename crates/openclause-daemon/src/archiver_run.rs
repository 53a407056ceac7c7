//! The archiver service runner: one-shot or interval mode.

use std::sync::Arc;

use secrecy::SecretString;

use openclause_core::archive::{Archiver, ObjectStore, S3ObjectStore};
use openclause_core::config::ArchiverConfig;
use openclause_core::evidence::EvidenceStore;

/// Runs the archiver until shutdown (or after one pass in one-shot
/// mode).
///
/// # Errors
///
/// Returns an error when startup wiring fails; per-tenant archive
/// failures are logged and retried on the next pass.
pub async fn run(config: ArchiverConfig) -> anyhow::Result<()> {
    let store = EvidenceStore::open(&config.db_path)?;
    let uploader: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(
        config.s3_endpoint.clone(),
        config.s3_bucket.clone(),
        config.s3_region.clone(),
        config.s3_access_key.clone(),
        config
            .s3_secret_key
            .clone()
            .unwrap_or_else(|| SecretString::from("minioadmin")),
        config.s3_secure,
    )?);
    let archiver = Archiver::new(store, uploader);

    archiver.run_pass(&config.tenant_id).await?;
    if config.run_once {
        return Ok(());
    }

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately and the first pass already ran.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = archiver.run_pass(&config.tenant_id).await {
                    tracing::error!(error = %e, "archive pass failed");
                }
            }
            () = crate::gateway::shutdown_signal() => {
                tracing::info!("archiver stopping");
                return Ok(());
            }
        }
    }
}
