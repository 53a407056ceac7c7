//! The approvals service: approver-facing API, the Slack interaction
//! callback, and the notification dispatcher loop.

mod slack;

pub use slack::verify_slack_signature;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde::Deserialize;

use openclause_core::approvals::{
    ApprovalError, ApprovalGrant, ApprovalRequest, ApproverAuthorizer, ApprovalStore,
    CreateApprovalInput, DenyInput, GrantInput,
};
use openclause_core::config::ApprovalsConfig;
use openclause_core::notify::{Dispatcher, OutboxStore};
use openclause_core::types::ApiError;

use crate::metrics::Metrics;
use crate::middleware::{internal_token_auth, InternalAuthState};

/// Request body cap (1 MiB).
const MAX_BODY_BYTES: usize = 1 << 20;

/// Shared state behind the approvals handlers.
#[derive(Clone)]
pub struct ApprovalsState {
    /// Approval requests, grants, and the outbox.
    pub store: Arc<ApprovalStore>,
    /// Per-tenant approver allowlists.
    pub authorizer: Arc<ApproverAuthorizer>,
    /// Slack request signing secret for the interaction callback.
    pub slack_signing_secret: Option<SecretString>,
}

/// Maps store failures onto the error taxonomy: unknown ids are 404,
/// already-decided and expired requests are 409, bad input is 400, and
/// everything else is an internal error.
fn approval_error(err: ApprovalError, action: &str) -> ApiError {
    match err {
        ApprovalError::NotFound { .. } => {
            ApiError::NotFound("approval request not found".to_string())
        }
        ApprovalError::NotPending { .. } | ApprovalError::Expired { .. } => {
            ApiError::Conflict(err.to_string())
        }
        ApprovalError::MissingField { .. } => ApiError::BadRequest(err.to_string()),
        other => {
            tracing::error!(error = %other, action, "approval store failure");
            ApiError::Internal(format!("failed to {action}"))
        }
    }
}

/// `POST /v1/approvals/requests` — internal: the gateway records the
/// approve event first, then registers the approval request here.
async fn create_request(
    State(state): State<ApprovalsState>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<ApprovalRequest>), ApiError> {
    let input: CreateApprovalInput = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("invalid JSON body".to_string()))?;
    if input.tenant_id.is_empty()
        || input.event_id.is_empty()
        || input.tool.is_empty()
        || input.action.is_empty()
    {
        return Err(ApiError::BadRequest(
            "tenant_id, event_id, tool, and action are required".to_string(),
        ));
    }
    let request = state
        .store
        .create_request(&input)
        .map_err(|e| approval_error(e, "create approval request"))?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// `GET /v1/approvals/requests/{id}`.
async fn get_request(
    State(state): State<ApprovalsState>,
    Path(id): Path<String>,
) -> Result<Json<ApprovalRequest>, ApiError> {
    let request = state
        .store
        .get_request(&id)
        .map_err(|e| approval_error(e, "retrieve approval request"))?;
    request
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("approval request not found".to_string()))
}

/// `POST /v1/approvals/requests/{id}/approve` — transitions the request
/// and mints a grant; the approver must be on the tenant's allowlist.
async fn approve_request(
    State(state): State<ApprovalsState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<ApprovalGrant>), ApiError> {
    let input: GrantInput = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("invalid JSON body".to_string()))?;
    if input.approver.is_empty() {
        return Err(ApiError::BadRequest("approver is required".to_string()));
    }
    let request = state
        .store
        .get_request(&id)
        .map_err(|e| approval_error(e, "approve request"))?
        .ok_or_else(|| ApiError::NotFound("approval request not found".to_string()))?;
    if !state.authorizer.allow_email(&request.tenant_id, &input.approver) {
        return Err(ApiError::Forbidden("approver is not allowed for tenant".to_string()));
    }

    let grant = state
        .store
        .grant_request(&id, &input)
        .map_err(|e| approval_error(e, "approve request"))?;
    tracing::info!(
        request_id = %id,
        tenant_id = %request.tenant_id,
        approver = %input.approver,
        grant_id = %grant.id,
        "approval granted"
    );
    Ok((StatusCode::CREATED, Json(grant)))
}

/// `POST /v1/approvals/requests/{id}/deny`.
async fn deny_request(
    State(state): State<ApprovalsState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let input: DenyInput = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("invalid JSON body".to_string()))?;
    if input.approver.is_empty() {
        return Err(ApiError::BadRequest("approver is required".to_string()));
    }
    let request = state
        .store
        .get_request(&id)
        .map_err(|e| approval_error(e, "deny request"))?
        .ok_or_else(|| ApiError::NotFound("approval request not found".to_string()))?;
    if !state.authorizer.allow_email(&request.tenant_id, &input.approver) {
        return Err(ApiError::Forbidden("approver is not allowed for tenant".to_string()));
    }

    state.store.deny_request(&id, &input).map_err(|e| approval_error(e, "deny request"))?;
    tracing::info!(
        request_id = %id,
        tenant_id = %request.tenant_id,
        approver = %input.approver,
        "approval denied"
    );
    Ok(Json(serde_json::json!({"status": "denied"})))
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

/// `GET /v1/approvals/pending?tenant_id&limit&offset`.
async fn list_pending(
    State(state): State<ApprovalsState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<ApprovalRequest>>, ApiError> {
    if query.tenant_id.is_empty() {
        return Err(ApiError::BadRequest("tenant_id query param required".to_string()));
    }
    let requests = state
        .store
        .list_pending(&query.tenant_id, query.limit.unwrap_or(0), query.offset.unwrap_or(0))
        .map_err(|e| approval_error(e, "list pending requests"))?;
    Ok(Json(requests))
}

async fn healthz() -> &'static str {
    "OK"
}

/// Builds the approvals router. The `/v1/approvals` API requires the
/// internal token; the Slack callback authenticates via Slack's request
/// signature instead.
pub fn router(state: ApprovalsState, internal_token: Option<SecretString>) -> Router {
    let internal = InternalAuthState { token: internal_token };
    Router::new()
        .route("/v1/approvals/requests", post(create_request))
        .route("/v1/approvals/requests/{id}", get(get_request))
        .route("/v1/approvals/requests/{id}/approve", post(approve_request))
        .route("/v1/approvals/requests/{id}/deny", post(deny_request))
        .route("/v1/approvals/pending", get(list_pending))
        .layer(axum::middleware::from_fn_with_state(internal, internal_token_auth))
        .route("/v1/integrations/slack/interactions", post(slack::interactions))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Runs the approvals service (and, when enabled, the dispatcher loop)
/// until shutdown.
///
/// # Errors
///
/// Returns an error when startup wiring fails.
pub async fn run(config: ApprovalsConfig) -> anyhow::Result<()> {
    let store = Arc::new(ApprovalStore::open(&config.db_path)?);
    let authorizer = Arc::new(ApproverAuthorizer::new(
        &config.approver_email_allowlist,
        &config.approver_slack_allowlist,
    ));
    let metrics = Arc::new(Metrics::new()?);

    let state = ApprovalsState {
        store: Arc::clone(&store),
        authorizer,
        slack_signing_secret: config.slack_signing_secret.clone(),
    };

    if config.notifier_enabled {
        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn OutboxStore>,
            config.notifier_source.clone(),
            config.webhook_secrets.clone(),
            config.connector_slack_url.clone(),
            config.internal_token.clone(),
        )?;
        let interval = config.notifier_interval;
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            dispatch_loop(dispatcher, interval, metrics).await;
        });
    }

    let metrics_addr = config.metrics_addr.clone();
    let metrics_for_server = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = crate::metrics::serve(&metrics_addr, metrics_for_server).await {
            tracing::error!(error = %e, "metrics server error");
        }
    });

    let app = router(state, config.internal_token.clone());
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(addr = %config.addr, "approvals service starting");
    axum::serve(listener, app)
        .with_graceful_shutdown(crate::gateway::shutdown_signal())
        .await?;
    tracing::info!("approvals service shut down");
    Ok(())
}

async fn dispatch_loop(dispatcher: Dispatcher, interval: std::time::Duration, metrics: Arc<Metrics>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match dispatcher.dispatch_once().await {
                    Ok(stats) => {
                        if stats.claimed > 0 {
                            tracing::debug!(
                                claimed = stats.claimed,
                                sent = stats.sent,
                                retried = stats.retried,
                                failed = stats.failed,
                                "notification dispatch tick"
                            );
                        }
                        metrics.notifications.with_label_values(&["sent"]).inc_by(stats.sent as u64);
                        metrics.notifications.with_label_values(&["retried"]).inc_by(stats.retried as u64);
                        metrics.notifications.with_label_values(&["failed"]).inc_by(stats.failed as u64);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "notification dispatch failed");
                    }
                }
            }
            () = crate::gateway::shutdown_signal() => {
                tracing::info!("notification dispatcher stopping");
                return;
            }
        }
    }
}
