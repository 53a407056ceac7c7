//! Handler-level tests for the gateway pipeline, using in-memory
//! collaborators behind the capability traits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Extension;

use openclause_core::approvals::ApprovalStore;
use openclause_core::connectors::{ConnectorError, ExecRequest, ExecResponse};
use openclause_core::evidence::{EvidenceError, EvidenceStore};
use openclause_core::policy::PolicyError;
use openclause_core::ratelimit::TenantRateLimiter;
use openclause_core::types::{
    ApiError, Decision, ExecStatus, NotifyRoute, PolicyInput, PolicyResult, ToolCallEnvelope,
    ToolCallResponse,
};

use super::handlers;
use super::{GatewayEvidence, GatewayState};
use crate::metrics::Metrics;
use crate::middleware::TenantId;

struct ScriptedPolicy {
    result: Mutex<Result<PolicyResult, String>>,
    last_input: Mutex<Option<PolicyInput>>,
}

impl ScriptedPolicy {
    fn allow() -> Self {
        Self::with(Ok(PolicyResult::allow("low risk")))
    }

    fn with(result: Result<PolicyResult, String>) -> Self {
        Self { result: Mutex::new(result), last_input: Mutex::new(None) }
    }

    fn set(&self, result: Result<PolicyResult, String>) {
        *self.result.lock().unwrap() = result;
    }
}

#[async_trait]
impl super::GatewayPolicy for ScriptedPolicy {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyResult, PolicyError> {
        *self.last_input.lock().unwrap() = Some(input.clone());
        match &*self.result.lock().unwrap() {
            Ok(result) => Ok(result.clone()),
            Err(msg) => Err(PolicyError::Status { status: 500, snippet: msg.clone() }),
        }
    }
}

struct CountingConnector {
    calls: AtomicUsize,
    fail_timeout: bool,
}

impl CountingConnector {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0), fail_timeout: false }
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl super::GatewayConnectors for CountingConnector {
    async fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_timeout {
            return Err(ConnectorError::Timeout { tool: req.tool.clone() });
        }
        Ok(ExecResponse {
            status: "success".into(),
            output_json: Some(serde_json::json!({"echo": req.action})),
            error: String::new(),
        })
    }
}

/// Evidence wrapper that fails every chain append; reads pass through.
struct BrokenEvidence {
    inner: EvidenceStore,
}

impl GatewayEvidence for BrokenEvidence {
    fn record_event(&self, _env: &mut ToolCallEnvelope) -> Result<(), EvidenceError> {
        Err(EvidenceError::Corrupt("write path disabled".into()))
    }

    fn check_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<ToolCallResponse>, EvidenceError> {
        self.inner.check_idempotency(tenant_id, key)
    }

    fn get_event(&self, event_id: &str) -> Result<Option<ToolCallEnvelope>, EvidenceError> {
        self.inner.get_event(event_id)
    }

    fn get_execution_by_parent(
        &self,
        parent: &str,
    ) -> Result<Option<ToolCallResponse>, EvidenceError> {
        self.inner.get_execution_by_parent(parent)
    }

    fn link_execution_to_parent(
        &self,
        parent: &str,
        exec: &str,
        grant: &str,
    ) -> Result<bool, EvidenceError> {
        self.inner.link_execution_to_parent(parent, exec, grant)
    }

    fn tenant_config(
        &self,
        tenant_id: &str,
    ) -> Result<std::collections::BTreeMap<String, String>, EvidenceError> {
        self.inner.tenant_config(tenant_id)
    }

    fn ping(&self) -> Result<(), EvidenceError> {
        self.inner.ping()
    }
}

struct Harness {
    state: GatewayState,
    evidence: EvidenceStore,
    approvals: Arc<ApprovalStore>,
    policy: Arc<ScriptedPolicy>,
    connector: Arc<CountingConnector>,
}

fn harness() -> Harness {
    harness_with_rate(1000)
}

fn harness_with_rate(rate: u64) -> Harness {
    let evidence = EvidenceStore::in_memory().expect("evidence");
    let approvals = Arc::new(ApprovalStore::in_memory().expect("approvals"));
    let policy = Arc::new(ScriptedPolicy::allow());
    let connector = Arc::new(CountingConnector::new());
    let state = GatewayState {
        evidence: Arc::new(evidence.clone()),
        policy: Arc::clone(&policy) as Arc<dyn super::GatewayPolicy>,
        connectors: Arc::clone(&connector) as Arc<dyn super::GatewayConnectors>,
        approvals: Arc::clone(&approvals) as Arc<dyn super::GatewayApprovals>,
        approvals_url: "http://approvals.internal:8081".into(),
        limiter: Arc::new(TenantRateLimiter::new(rate)),
        metrics: Arc::new(Metrics::new().expect("metrics")),
    };
    Harness { state, evidence, approvals, policy, connector }
}

fn body(risk: i64, key: &str) -> Bytes {
    Bytes::from(
        serde_json::json!({
            "tenant_id": "ignored-by-auth",
            "agent_id": "agent-1",
            "tool": "slack",
            "action": "msg.post",
            "params": {"channel": "#general", "text": "hi"},
            "resource": "slack://channel/general",
            "risk_score": risk,
            "idempotency_key": key,
        })
        .to_string(),
    )
}

fn tenant() -> Extension<TenantId> {
    Extension(TenantId("tenant1".into()))
}

async fn submit(h: &Harness, body: Bytes) -> Result<ToolCallResponse, ApiError> {
    handlers::submit_toolcall(State(h.state.clone()), tenant(), body)
        .await
        .map(|json| json.0)
}

#[tokio::test]
async fn allow_path_executes_and_records() {
    let h = harness();

    let resp = submit(&h, body(2, "demo-001")).await.expect("submit");
    assert_eq!(resp.decision, Decision::Allow);
    let result = resp.result.expect("execution result");
    assert_eq!(result.status, ExecStatus::Success);
    assert_eq!(h.connector.count(), 1);

    let env = h.evidence.get_event(&resp.event_id).expect("get").expect("recorded");
    assert_eq!(env.decision, Decision::Allow);
    assert_eq!(env.request.tenant_id, "tenant1", "authenticated tenant overrides body");
    assert!(env.execution_result.is_some());
    assert!(!env.hash.is_empty());
}

#[tokio::test]
async fn deny_path_records_without_executing() {
    let h = harness();
    h.policy.set(Ok(PolicyResult::deny("blocked by rule")));

    let resp = submit(&h, body(2, "demo-001")).await.expect("submit");
    assert_eq!(resp.decision, Decision::Deny);
    assert_eq!(resp.reason, "blocked by rule");
    assert!(resp.result.is_none());
    assert_eq!(h.connector.count(), 0);

    let env = h.evidence.get_event(&resp.event_id).expect("get").expect("recorded");
    assert_eq!(env.decision, Decision::Deny);
}

#[tokio::test]
async fn approve_path_creates_request_and_outbox() {
    let h = harness();
    h.policy.set(Ok(PolicyResult {
        decision: Decision::Approve,
        reason: "risk above threshold".into(),
        notify: vec![NotifyRoute {
            kind: "webhook".into(),
            url: "https://hooks.example.com/oc".into(),
            secret_ref: "hooks-prod".into(),
            channel: String::new(),
        }],
        approver_group: "sec-ops".into(),
        ..PolicyResult::deny("")
    }));

    let resp = submit(&h, body(8, "demo-002")).await.expect("submit");
    assert_eq!(resp.decision, Decision::Approve);
    let approval_url = resp.approval_url.expect("approval url");
    let request_id = approval_url.rsplit('/').next().expect("id in url");

    let request = h.approvals.get_request(request_id).expect("get").expect("created");
    assert_eq!(request.event_id, resp.event_id);
    assert_eq!(request.tenant_id, "tenant1");
    let outbox = h.approvals.list_notifications_for_request(request_id).expect("outbox");
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].approver_group, "sec-ops");

    assert_eq!(h.connector.count(), 0, "approve never executes inline");
}

#[tokio::test]
async fn policy_failure_fails_closed_to_deny() {
    let h = harness();
    h.policy.set(Err("engine down".into()));

    let resp = submit(&h, body(2, "demo-003")).await.expect("submit");
    assert_eq!(resp.decision, Decision::Deny);
    assert_eq!(resp.reason, "policy evaluation failed");
    assert_eq!(h.connector.count(), 0);

    let env = h.evidence.get_event(&resp.event_id).expect("get").expect("recorded");
    assert_eq!(env.decision, Decision::Deny);
}

#[tokio::test]
async fn duplicate_submit_replays_without_second_execution() {
    let h = harness();

    let first = submit(&h, body(2, "demo-004")).await.expect("first");
    let second = submit(&h, body(2, "demo-004")).await.expect("second");
    assert_eq!(first.event_id, second.event_id);
    assert_eq!(second.reason, "idempotent replay");
    assert_eq!(h.connector.count(), 1, "connector side effect happens at most once");
}

#[tokio::test]
async fn rate_limit_rejects_burst_overflow() {
    let h = harness_with_rate(1);

    // Capacity is 2 × rate: two immediate requests pass, the third 429s.
    submit(&h, body(2, "rl-1")).await.expect("first");
    submit(&h, body(2, "rl-2")).await.expect("second");
    let err = submit(&h, body(2, "rl-3")).await.unwrap_err();
    assert!(matches!(err, ApiError::RateLimited));
}

#[tokio::test]
async fn invalid_body_and_bounds_are_rejected() {
    let h = harness();

    let err = submit(&h, Bytes::from_static(b"{not json")).await.unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let err = submit(&h, body(11, "demo-005")).await.unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));

    assert_eq!(h.connector.count(), 0);
}

#[tokio::test]
async fn connector_timeout_is_recorded_as_timeout_result() {
    let mut h = harness();
    let connector = Arc::new(CountingConnector { calls: AtomicUsize::new(0), fail_timeout: true });
    h.state.connectors = Arc::clone(&connector) as Arc<dyn super::GatewayConnectors>;

    let resp = submit(&h, body(2, "demo-006")).await.expect("submit");
    assert_eq!(resp.decision, Decision::Allow);
    let result = resp.result.expect("result");
    assert_eq!(result.status, ExecStatus::Timeout);
    assert!(result.error.contains("timed out"));
}

#[tokio::test]
async fn evidence_failure_after_execution_is_internal_error() {
    let mut h = harness();
    h.state.evidence = Arc::new(BrokenEvidence { inner: h.evidence.clone() });

    let err = submit(&h, body(2, "demo-007")).await.unwrap_err();
    assert!(matches!(err, ApiError::Internal(_)));
    assert_eq!(h.connector.count(), 1, "side effect happened before the storage fault");
}

async fn submit_approved(h: &Harness, key: &str) -> ToolCallResponse {
    h.policy.set(Ok(PolicyResult {
        decision: Decision::Approve,
        reason: "requires approval".into(),
        ..PolicyResult::deny("")
    }));
    let resp = submit(h, body(8, key)).await.expect("submit");
    assert_eq!(resp.decision, Decision::Approve);
    resp
}

async fn execute(
    h: &Harness,
    event_id: &str,
) -> Result<ToolCallResponse, ApiError> {
    handlers::execute_toolcall(
        State(h.state.clone()),
        tenant(),
        Path(event_id.to_string()),
    )
    .await
    .map(|json| json.0)
}

#[tokio::test]
async fn execute_without_grant_awaits_approval() {
    let h = harness();
    let parent = submit_approved(&h, "exec-001").await;

    let err = execute(&h, &parent.event_id).await.unwrap_err();
    match err {
        ApiError::Conflict(msg) => assert_eq!(msg, "awaiting approval"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.connector.count(), 0);
}

#[tokio::test]
async fn execute_consumes_grant_and_replays_identically() {
    let h = harness();
    let parent = submit_approved(&h, "exec-002").await;
    let approval_url = parent.approval_url.clone().expect("url");
    let request_id = approval_url.rsplit('/').next().expect("id");
    h.approvals
        .grant_request(
            request_id,
            &openclause_core::approvals::GrantInput {
                approver: "alice@example.com".into(),
                max_uses: 1,
                expires_in_sec: 3600,
                resource_pattern: None,
            },
        )
        .expect("grant");

    let first = execute(&h, &parent.event_id).await.expect("execute");
    assert_eq!(first.decision, Decision::Allow);
    assert_eq!(first.reason, "approved execution");
    assert!(first.result.is_some());
    assert_eq!(h.connector.count(), 1);

    // Replay: same execution event, no second connector call, even
    // though the single-use grant is gone.
    let second = execute(&h, &parent.event_id).await.expect("replay");
    assert_eq!(second.event_id, first.event_id);
    assert_eq!(h.connector.count(), 1);

    // The execution event exists with a derived idempotency key.
    let exec_env = h.evidence.get_event(&first.event_id).expect("get").expect("recorded");
    assert_eq!(exec_env.request.idempotency_key, format!("exec:{}", parent.event_id));
}

#[tokio::test]
async fn execute_rejects_non_approve_parent_and_foreign_tenant() {
    let h = harness();

    let allowed = submit(&h, body(2, "exec-003")).await.expect("submit");
    let err = execute(&h, &allowed.event_id).await.unwrap_err();
    match err {
        ApiError::Conflict(msg) => assert_eq!(msg, "event does not require approval execution"),
        other => panic!("unexpected error: {other}"),
    }

    let parent = submit_approved(&h, "exec-004").await;
    let err = handlers::execute_toolcall(
        State(h.state.clone()),
        Extension(TenantId("tenant2".into())),
        Path(parent.event_id.clone()),
    )
    .await
    .map(|json| json.0)
    .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));

    let err = execute(&h, "not-a-uuid").await.unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let err = execute(&h, "00000000-0000-4000-8000-000000000000").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn policy_receives_tenant_config() {
    let h = harness();
    let mut config = std::collections::BTreeMap::new();
    config.insert("max_risk_auto_approve".to_string(), "7".to_string());
    h.evidence.upsert_tenant("tenant1", "Tenant One", &config).expect("tenant");

    submit(&h, body(2, "cfg-001")).await.expect("submit");
    let input = h.policy.last_input.lock().unwrap().clone().expect("policy consulted");
    assert_eq!(
        input.environment.tenant_config.get("max_risk_auto_approve").map(String::as_str),
        Some("7")
    );
}
