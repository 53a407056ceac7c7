//! The gateway service: single entrypoint for AI-agent tool calls.

mod handlers;
mod traits;

#[cfg(test)]
mod tests;

pub use traits::{GatewayApprovals, GatewayConnectors, GatewayEvidence, GatewayPolicy};

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use secrecy::ExposeSecret;

use openclause_core::approvals::ApprovalStore;
use openclause_core::auth::ApiKeyStore;
use openclause_core::config::GatewayConfig;
use openclause_core::connectors::ConnectorRegistry;
use openclause_core::evidence::EvidenceStore;
use openclause_core::policy::PolicyClient;
use openclause_core::ratelimit::TenantRateLimiter;

use crate::metrics::Metrics;
use crate::middleware::{api_key_auth, ApiKeyAuthState};

/// Request body cap (1 MiB).
const MAX_BODY_BYTES: usize = 1 << 20;

/// Shared state behind the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    /// Evidence chain operations.
    pub evidence: Arc<dyn GatewayEvidence>,
    /// Policy evaluation.
    pub policy: Arc<dyn GatewayPolicy>,
    /// Connector execution.
    pub connectors: Arc<dyn GatewayConnectors>,
    /// Approval request creation and grant consumption.
    pub approvals: Arc<dyn GatewayApprovals>,
    /// Base URL of the approvals service, for approval links.
    pub approvals_url: String,
    /// Per-tenant token buckets.
    pub limiter: Arc<TenantRateLimiter>,
    /// Service metrics.
    pub metrics: Arc<Metrics>,
}

async fn healthz() -> &'static str {
    "OK"
}

async fn readyz(State(state): State<GatewayState>) -> (StatusCode, &'static str) {
    match state.evidence.ping() {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::error!(error = %e, "readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }
}

/// Builds the public gateway router. The `/v1` routes sit behind the
/// API-key middleware; health probes do not.
pub fn router(state: GatewayState, keys: Arc<ApiKeyStore>) -> Router {
    let auth = ApiKeyAuthState { keys };
    Router::new()
        .route("/v1/toolcalls", post(handlers::submit_toolcall))
        .route("/v1/toolcalls/{event_id}", get(handlers::get_event))
        .route("/v1/toolcalls/{event_id}/execute", post(handlers::execute_toolcall))
        .layer(axum::middleware::from_fn_with_state(auth, api_key_auth))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Runs the gateway until shutdown.
///
/// # Errors
///
/// Returns an error when startup wiring (stores, clients, listeners)
/// fails; runtime request errors are handled per request.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let evidence = EvidenceStore::open(&config.db_path)?;
    let approvals = ApprovalStore::open(&config.db_path)?;
    let policy = PolicyClient::new(&config.policy_url)?;

    let connectors = ConnectorRegistry::new();
    connectors.register("slack", &config.connector_slack_url);
    connectors.register("jira", &config.connector_jira_url);
    if let Some(token) = &config.internal_token {
        connectors.set_internal_token(token.expose_secret().to_string().into());
    }

    let keys = Arc::new(ApiKeyStore::parse(&config.api_keys));
    if keys.is_empty() {
        tracing::warn!("no API keys configured; all requests will be rejected");
    }

    let metrics = Arc::new(Metrics::new()?);
    let state = GatewayState {
        evidence: Arc::new(evidence),
        policy: Arc::new(policy),
        connectors: Arc::new(connectors),
        approvals: Arc::new(approvals),
        approvals_url: config.approvals_url.clone(),
        limiter: Arc::new(TenantRateLimiter::new(config.rate_limit_per_tenant)),
        metrics: Arc::clone(&metrics),
    };

    let metrics_addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::metrics::serve(&metrics_addr, metrics).await {
            tracing::error!(error = %e, "metrics server error");
        }
    });

    let app = router(state, keys);
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(addr = %config.addr, "gateway starting");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("gateway shut down");
    Ok(())
}

pub(crate) async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "shutdown signal listener failed");
    }
}
