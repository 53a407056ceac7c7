//! The gateway request pipeline.

use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;
use uuid::Uuid;

use openclause_core::approvals::CreateApprovalInput;
use openclause_core::connectors::ExecRequest;
use openclause_core::types::{
    ApiError, Decision, ExecStatus, ExecutionResult, PolicyEnvironment, PolicyInput, PolicyResult,
    ToolCallEnvelope, ToolCallRequest, ToolCallResponse,
};

use super::GatewayState;
use crate::middleware::TenantId;

/// How many times the execute resume polls for a concurrent winner
/// before answering "awaiting approval".
const EXECUTE_POLL_COUNT: u32 = 5;

/// Pause between execute-resume polls.
const EXECUTE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// `POST /v1/toolcalls` — validate, rate-limit, dedupe, evaluate policy,
/// and dispatch on the decision.
pub async fn submit_toolcall(
    State(state): State<GatewayState>,
    Extension(tenant): Extension<TenantId>,
    body: Bytes,
) -> Result<Json<ToolCallResponse>, ApiError> {
    let mut req: ToolCallRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("invalid JSON body".to_string()))?;
    req.normalize_and_validate()?;

    // The authenticated tenant is authoritative; whatever the body said
    // is discarded.
    req.tenant_id = tenant.0;

    if !state.limiter.allow(&req.tenant_id) {
        return Err(ApiError::RateLimited);
    }

    // Fail closed: if we cannot prove the request is new, we refuse to
    // act on it.
    let prior = state
        .evidence
        .check_idempotency(&req.tenant_id, &req.idempotency_key)
        .map_err(|e| {
            tracing::error!(error = %e, "idempotency check failed");
            ApiError::Internal("failed to validate idempotency".to_string())
        })?;
    if let Some(prior) = prior {
        tracing::info!(
            tenant_id = %req.tenant_id,
            idempotency_key = %req.idempotency_key,
            event_id = %prior.event_id,
            "idempotency hit"
        );
        return Ok(Json(prior));
    }

    let event_id = Uuid::new_v4().to_string();

    let tenant_config = state.evidence.tenant_config(&req.tenant_id).map_err(|e| {
        tracing::error!(error = %e, "tenant config lookup failed");
        ApiError::Internal("request processing failed".to_string())
    })?;
    let policy_input = PolicyInput {
        toolcall: req.clone(),
        environment: PolicyEnvironment { timestamp: Utc::now(), tenant_config },
    };
    let policy_result = match state.policy.evaluate(&policy_input).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, event_id = %event_id, "policy evaluation failed");
            PolicyResult::deny("policy evaluation failed")
        }
    };

    let mut env = ToolCallEnvelope::new(event_id.clone(), req.clone());
    env.decision = policy_result.decision;
    env.policy_result = Some(policy_result.clone());

    let mut resp = ToolCallResponse {
        event_id: event_id.clone(),
        decision: policy_result.decision,
        reason: policy_result.reason.clone(),
        approval_url: None,
        result: None,
    };

    match policy_result.decision {
        Decision::Deny => {
            record_best_effort(&state, &mut env);
        }

        Decision::Approve => {
            // Evidence first, so the approval request can reference the
            // event row.
            record_best_effort(&state, &mut env);
            let create = CreateApprovalInput {
                event_id: event_id.clone(),
                tenant_id: req.tenant_id.clone(),
                agent_id: req.agent_id.clone(),
                tool: req.tool.clone(),
                action: req.action.clone(),
                resource: req.resource.clone(),
                risk_score: req.risk_score,
                risk_factors: req.risk_factors.clone(),
                reason: policy_result.reason.clone(),
                trace_id: req.trace_id.clone(),
                approver_group: policy_result.approver_group.clone(),
                notify: policy_result.notify.clone(),
                approval_base_url: state.approvals_url.clone(),
            };
            match state.approvals.create_request(&create) {
                Ok(approval) => {
                    resp.approval_url = Some(openclause_core::approvals::build_approval_url(
                        &state.approvals_url,
                        &approval.id,
                    ));
                }
                Err(e) => {
                    tracing::error!(error = %e, event_id = %event_id, "create approval failed");
                }
            }
        }

        Decision::Allow => {
            let result = execute_connector(&state, &event_id, &req).await;
            env.execution_result = Some(result.clone());
            resp.result = Some(result);

            // The connector side effect has happened; losing the record
            // now must surface as an error so the caller retries into the
            // idempotency path once storage recovers.
            if let Err(e) = state.evidence.record_event(&mut env) {
                tracing::error!(error = %e, event_id = %event_id, "evidence record failed after execution");
                return Err(ApiError::Internal(
                    "evidence recording failed after execution".to_string(),
                ));
            }
            log_recorded(&env);
        }
    }

    state
        .metrics
        .toolcall_decisions
        .with_label_values(&[env.decision.as_str()])
        .inc();
    Ok(Json(resp))
}

/// `GET /v1/toolcalls/{event_id}` — fetch a persisted event. Cross-tenant
/// lookups 404 so existence is never leaked.
pub async fn get_event(
    State(state): State<GatewayState>,
    Extension(tenant): Extension<TenantId>,
    Path(event_id): Path<String>,
) -> Result<Json<ToolCallEnvelope>, ApiError> {
    if Uuid::parse_str(&event_id).is_err() {
        return Err(ApiError::BadRequest("invalid event_id format".to_string()));
    }

    let env = state.evidence.get_event(&event_id).map_err(|e| {
        tracing::error!(error = %e, event_id = %event_id, "get event failed");
        ApiError::Internal("failed to retrieve event".to_string())
    })?;
    match env {
        Some(env) if env.request.tenant_id == tenant.0 => Ok(Json(env)),
        _ => Err(ApiError::NotFound("event not found".to_string())),
    }
}

/// `POST /v1/toolcalls/{event_id}/execute` — resume an approved request
/// once a grant exists, recording the execution as a new evidence event
/// linked to the parent. Exactly one execution ever happens per parent,
/// however many callers race here.
pub async fn execute_toolcall(
    State(state): State<GatewayState>,
    Extension(tenant): Extension<TenantId>,
    Path(parent_event_id): Path<String>,
) -> Result<Json<ToolCallResponse>, ApiError> {
    if Uuid::parse_str(&parent_event_id).is_err() {
        return Err(ApiError::BadRequest("invalid event_id format".to_string()));
    }

    let parent = state.evidence.get_event(&parent_event_id).map_err(|e| {
        tracing::error!(error = %e, event_id = %parent_event_id, "get parent event failed");
        ApiError::Internal("failed to retrieve event".to_string())
    })?;
    let Some(parent) = parent else {
        return Err(ApiError::NotFound("event not found".to_string()));
    };
    if parent.request.tenant_id != tenant.0 {
        return Err(ApiError::NotFound("event not found".to_string()));
    }
    if parent.decision != Decision::Approve {
        return Err(ApiError::Conflict("event does not require approval execution".to_string()));
    }

    // Idempotent replay: a prior execution is the canonical answer.
    if let Some(existing) = get_replay(&state, &parent_event_id)? {
        return Ok(Json(existing));
    }

    let grant = state
        .approvals
        .find_and_consume_grant(
            &parent.request.tenant_id,
            &parent.request.agent_id,
            &parent.request.tool,
            &parent.request.action,
            &parent.request.resource,
        )
        .map_err(|e| {
            tracing::error!(error = %e, event_id = %parent_event_id, "grant consume failed");
            ApiError::Internal("failed to consume approval grant".to_string())
        })?;

    let Some(grant) = grant else {
        // No grant: another caller may hold it and be mid-execution.
        // Poll briefly for their linked result before failing closed.
        for _ in 0..EXECUTE_POLL_COUNT {
            tokio::time::sleep(EXECUTE_POLL_INTERVAL).await;
            if let Some(existing) = get_replay(&state, &parent_event_id)? {
                return Ok(Json(existing));
            }
        }
        return Err(ApiError::Conflict("awaiting approval".to_string()));
    };

    let execution_event_id = Uuid::new_v4().to_string();
    let mut request = parent.request.clone();
    // The parent's idempotency key is taken; executions get a derived
    // one, unique per parent.
    request.idempotency_key = format!("exec:{parent_event_id}");

    let result = execute_connector(&state, &execution_event_id, &request).await;

    let mut env = ToolCallEnvelope::new(execution_event_id.clone(), request);
    env.decision = Decision::Allow;
    env.policy_result = Some(PolicyResult::allow("approved execution"));
    env.execution_result = Some(result.clone());

    if let Err(e) = state.evidence.record_event(&mut env) {
        tracing::error!(error = %e, event_id = %execution_event_id, "execution evidence record failed");
        return Err(ApiError::Internal("failed to record execution evidence".to_string()));
    }
    log_recorded(&env);

    let linked = state
        .evidence
        .link_execution_to_parent(&parent_event_id, &execution_event_id, &grant.id)
        .map_err(|e| {
            tracing::error!(
                error = %e,
                parent_event_id = %parent_event_id,
                execution_event_id = %execution_event_id,
                "link execution failed"
            );
            ApiError::Internal("failed to finalize execution".to_string())
        })?;
    if !linked {
        // A concurrent caller linked first; theirs is the canonical
        // response.
        if let Some(prior) = get_replay(&state, &parent_event_id)? {
            return Ok(Json(prior));
        }
    }

    Ok(Json(ToolCallResponse {
        event_id: execution_event_id,
        decision: Decision::Allow,
        reason: "approved execution".to_string(),
        approval_url: None,
        result: Some(result),
    }))
}

fn get_replay(
    state: &GatewayState,
    parent_event_id: &str,
) -> Result<Option<ToolCallResponse>, ApiError> {
    state.evidence.get_execution_by_parent(parent_event_id).map_err(|e| {
        tracing::error!(error = %e, event_id = %parent_event_id, "get linked execution failed");
        ApiError::Internal("failed to retrieve prior execution".to_string())
    })
}

/// Invokes the connector and folds every failure mode into an
/// [`ExecutionResult`], so evidence always records what happened.
async fn execute_connector(
    state: &GatewayState,
    event_id: &str,
    req: &ToolCallRequest,
) -> ExecutionResult {
    let start = Instant::now();
    let exec_req = ExecRequest {
        event_id: event_id.to_string(),
        tenant_id: req.tenant_id.clone(),
        agent_id: req.agent_id.clone(),
        tool: req.tool.clone(),
        action: req.action.clone(),
        params: req.params.clone(),
        resource: req.resource.clone(),
    };

    let outcome = state.connectors.exec(&exec_req).await;
    let duration = start.elapsed();
    let duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);

    let result = match outcome {
        Ok(resp) => ExecutionResult {
            status: ExecStatus::parse_lossy(&resp.status),
            output_json: resp.output_json,
            error: resp.error,
            duration_ms,
        },
        Err(e) => {
            let status = if e.is_timeout() { ExecStatus::Timeout } else { ExecStatus::Error };
            ExecutionResult {
                status,
                output_json: None,
                error: e.to_string(),
                duration_ms,
            }
        }
    };
    state
        .metrics
        .connector_latency
        .with_label_values(&[&req.tool, result.status.as_str()])
        .observe(duration.as_secs_f64());
    result
}

/// Deny/approve evidence failures are logged, not surfaced: no external
/// side effect has happened, and the caller can safely retry.
fn record_best_effort(state: &GatewayState, env: &mut ToolCallEnvelope) {
    if let Err(e) = state.evidence.record_event(env) {
        tracing::error!(error = %e, event_id = %env.event_id, "evidence record failed");
        return;
    }
    log_recorded(env);
}

fn log_recorded(env: &ToolCallEnvelope) {
    tracing::info!(
        event_id = %env.event_id,
        tenant_id = %env.request.tenant_id,
        agent_id = %env.request.agent_id,
        tool = %env.request.tool,
        action = %env.request.action,
        decision = %env.decision,
        risk_score = env.request.risk_score,
        hash = %env.hash,
        "tool_event recorded"
    );
}
