//! Shared harness for the service integration tests: real stores on a
//! temp database, in-process gateway and approvals servers, and mock
//! policy-engine and connector endpoints.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use secrecy::SecretString;
use tempfile::TempDir;

use openclause_core::approvals::{ApprovalStore, ApproverAuthorizer};
use openclause_core::auth::ApiKeyStore;
use openclause_core::connectors::ConnectorRegistry;
use openclause_core::evidence::EvidenceStore;
use openclause_core::policy::PolicyClient;
use openclause_core::ratelimit::TenantRateLimiter;
use openclause_daemon::approvals_http::{self, ApprovalsState};
use openclause_daemon::gateway::{self, GatewayState};
use openclause_daemon::metrics::Metrics;

pub const TENANT1_KEY: &str = "sk-tenant1";
pub const TENANT2_KEY: &str = "sk-tenant2";
pub const INTERNAL_TOKEN: &str = "internal-secret";
pub const SLACK_SIGNING_SECRET: &str = "slack-signing-secret";

/// Auto-allow threshold the mock policy engine applies.
pub const MOCK_RISK_THRESHOLD: i64 = 7;

pub struct TestEnv {
    pub dir: TempDir,
    pub gateway_url: String,
    pub approvals_url: String,
    pub evidence: EvidenceStore,
    pub approvals: Arc<ApprovalStore>,
    pub connector_calls: Arc<AtomicUsize>,
    pub client: reqwest::Client,
}

impl TestEnv {
    pub fn db_path(&self) -> std::path::PathBuf {
        self.dir.path().join("openclause.db")
    }

    pub fn raw_db(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(self.db_path()).expect("open raw db")
    }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

/// Mock policy engine: allow below the risk threshold, approve at or
/// above it (with one webhook notification route), deny the tool named
/// `forbidden`.
async fn spawn_mock_policy() -> String {
    let app = Router::new().route(
        "/v1/data/oc/main",
        post(|Json(body): Json<serde_json::Value>| async move {
            let toolcall = &body["input"]["toolcall"];
            let risk = toolcall["risk_score"].as_i64().unwrap_or(0);
            let tool = toolcall["tool"].as_str().unwrap_or_default();
            let threshold = body["input"]["environment"]["tenant_config"]["max_risk_auto_approve"]
                .as_str()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(MOCK_RISK_THRESHOLD);

            let result = if tool == "forbidden" {
                serde_json::json!({
                    "decision": "deny",
                    "reason": "tool is forbidden",
                })
            } else if risk < threshold {
                serde_json::json!({
                    "decision": "allow",
                    "reason": format!("risk {risk} below threshold {threshold}"),
                })
            } else {
                serde_json::json!({
                    "decision": "approve",
                    "reason": format!("risk {risk} >= threshold {threshold}"),
                    "approver_group": "sec-ops",
                    "notify": [{
                        "kind": "webhook",
                        "url": "https://hooks.example.com/oc",
                        "secret_ref": "hooks-prod",
                    }],
                })
            };
            Json(serde_json::json!({"result": result}))
        }),
    );
    serve(app).await
}

/// Mock connector: records call counts and echoes success.
async fn spawn_mock_connector(calls: Arc<AtomicUsize>) -> String {
    let app = Router::new().route(
        "/exec",
        post(move |Json(body): Json<serde_json::Value>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({
                    "status": "success",
                    "output_json": {"posted": true, "action": body["action"]},
                }))
            }
        }),
    );
    serve(app).await
}

pub async fn spawn_env() -> TestEnv {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("openclause.db");

    let evidence = EvidenceStore::open(&db_path).expect("evidence store");
    let approvals = Arc::new(ApprovalStore::open(&db_path).expect("approval store"));

    let policy_url = spawn_mock_policy().await;
    let connector_calls = Arc::new(AtomicUsize::new(0));
    let connector_url = spawn_mock_connector(Arc::clone(&connector_calls)).await;

    let connectors = ConnectorRegistry::new();
    connectors.register("slack", &connector_url);
    connectors.register("jira", &connector_url);
    connectors.set_internal_token(SecretString::from(INTERNAL_TOKEN));

    // Approvals service first so the gateway can link to it.
    let approvals_state = ApprovalsState {
        store: Arc::clone(&approvals),
        authorizer: Arc::new(ApproverAuthorizer::new(
            "tenant1:alice@example.com,tenant2:carol@example.com",
            "tenant1:U111",
        )),
        slack_signing_secret: Some(SecretString::from(SLACK_SIGNING_SECRET)),
    };
    let approvals_url = serve(approvals_http::router(
        approvals_state,
        Some(SecretString::from(INTERNAL_TOKEN)),
    ))
    .await;

    let gateway_state = GatewayState {
        evidence: Arc::new(evidence.clone()),
        policy: Arc::new(PolicyClient::new(&policy_url).expect("policy client")),
        connectors: Arc::new(connectors),
        approvals: Arc::clone(&approvals) as Arc<dyn gateway::GatewayApprovals>,
        approvals_url: approvals_url.clone(),
        limiter: Arc::new(TenantRateLimiter::new(1000)),
        metrics: Arc::new(Metrics::new().expect("metrics")),
    };
    let keys = Arc::new(ApiKeyStore::parse(&format!(
        "tenant1:{TENANT1_KEY},tenant2:{TENANT2_KEY}"
    )));
    let gateway_url = serve(gateway::router(gateway_state, keys)).await;

    TestEnv {
        dir,
        gateway_url,
        approvals_url,
        evidence,
        approvals,
        connector_calls,
        client: reqwest::Client::new(),
    }
}

pub fn toolcall_body(risk: i64, idempotency_key: &str) -> serde_json::Value {
    serde_json::json!({
        "tenant_id": "tenant1",
        "agent_id": "agent-1",
        "tool": "slack",
        "action": "msg.post",
        "params": {"channel": "#general", "text": "deploy done"},
        "resource": "slack://channel/general",
        "risk_score": risk,
        "idempotency_key": idempotency_key,
    })
}

impl TestEnv {
    /// Submits a tool call with the given API key.
    pub async fn submit(
        &self,
        api_key: &str,
        body: &serde_json::Value,
    ) -> (reqwest::StatusCode, serde_json::Value) {
        let resp = self
            .client
            .post(format!("{}/v1/toolcalls", self.gateway_url))
            .header("X-API-Key", api_key)
            .json(body)
            .send()
            .await
            .expect("submit request");
        let status = resp.status();
        let body = resp.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    pub async fn get_event(
        &self,
        api_key: &str,
        event_id: &str,
    ) -> (reqwest::StatusCode, serde_json::Value) {
        let resp = self
            .client
            .get(format!("{}/v1/toolcalls/{event_id}", self.gateway_url))
            .header("X-API-Key", api_key)
            .send()
            .await
            .expect("get event");
        let status = resp.status();
        let body = resp.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    pub async fn execute(
        &self,
        api_key: &str,
        event_id: &str,
    ) -> (reqwest::StatusCode, serde_json::Value) {
        let resp = self
            .client
            .post(format!("{}/v1/toolcalls/{event_id}/execute", self.gateway_url))
            .header("X-API-Key", api_key)
            .send()
            .await
            .expect("execute");
        let status = resp.status();
        let body = resp.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    pub async fn approve(
        &self,
        request_id: &str,
        body: &serde_json::Value,
    ) -> (reqwest::StatusCode, serde_json::Value) {
        let resp = self
            .client
            .post(format!("{}/v1/approvals/requests/{request_id}/approve", self.approvals_url))
            .header("X-Internal-Token", INTERNAL_TOKEN)
            .json(body)
            .send()
            .await
            .expect("approve");
        let status = resp.status();
        let body = resp.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    /// Extracts the approval request id from an approve response's
    /// `approval_url`.
    pub fn request_id_from(&self, submit_body: &serde_json::Value) -> String {
        submit_body["approval_url"]
            .as_str()
            .expect("approval_url present")
            .rsplit('/')
            .next()
            .expect("request id")
            .to_string()
    }

    /// Rewrites an approval request's expiry into the past.
    pub fn expire_request(&self, request_id: &str) {
        let past = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp_millis();
        self.raw_db()
            .execute(
                "UPDATE approval_requests SET expires_at = ?2 WHERE id = ?1",
                rusqlite::params![request_id, past],
            )
            .expect("expire request");
    }
}
