//! HTTP client for the external policy engine.
//!
//! The engine is queried with `{input: {toolcall, environment}}` and
//! answers `{result: {decision, reason, ...}}`. Everything about the call
//! is fail-closed at the caller: transport errors, non-200 statuses, and
//! oversized or undecodable bodies surface as errors that the gateway
//! records as deny; decision strings outside the closed set collapse to
//! deny here.

use std::time::Duration;

use thiserror::Error;

use crate::httpbody::{read_capped, BodyError};
use crate::types::{Decision, NotifyRoute, PolicyInput, PolicyResult};

/// Per-evaluation deadline.
const POLICY_TIMEOUT: Duration = Duration::from_secs(5);

/// Response body cap.
const MAX_POLICY_RESPONSE_BYTES: usize = 1 << 20;

/// Data path of the policy package consulted for tool calls.
const POLICY_DATA_PATH: &str = "/v1/data/oc/main";

/// Errors from one policy evaluation.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Request could not be sent or the response not read.
    #[error("policy request: {0}")]
    Transport(#[from] reqwest::Error),

    /// The engine answered with a non-200 status.
    #[error("policy engine returned {status}: {snippet}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Bounded body snippet.
        snippet: String,
    },

    /// The engine's response exceeded the size cap.
    #[error("policy response exceeds {limit} bytes")]
    ResponseTooLarge {
        /// The cap that was exceeded.
        limit: usize,
    },

    /// The engine's response was not valid JSON of the expected shape.
    #[error("policy decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<BodyError> for PolicyError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::Transport(e) => Self::Transport(e),
            BodyError::TooLarge { limit } => Self::ResponseTooLarge { limit },
        }
    }
}

#[derive(serde::Serialize)]
struct EngineRequest<'a> {
    input: &'a PolicyInput,
}

#[derive(Default, serde::Deserialize)]
struct EngineResponse {
    #[serde(default)]
    result: EngineResult,
}

#[derive(Default, serde::Deserialize)]
struct EngineResult {
    #[serde(default)]
    decision: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    requirements: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    notify: Vec<NotifyRoute>,
    #[serde(default)]
    approver_group: String,
}

/// Client for the external policy engine.
pub struct PolicyClient {
    base_url: String,
    http: reqwest::Client,
}

impl PolicyClient {
    /// Creates a client for the engine at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self, PolicyError> {
        let http = reqwest::Client::builder().timeout(POLICY_TIMEOUT).build()?;
        let base_url: String = base_url.into();
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), http })
    }

    /// Evaluates one request against the engine.
    ///
    /// Decision strings outside {allow, deny, approve} — including the
    /// empty string — become deny; the reason records why.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-200 status, an
    /// oversized body, or an undecodable response. Callers treat any
    /// error as deny with reason "policy evaluation failed".
    pub async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyResult, PolicyError> {
        let url = format!("{}{POLICY_DATA_PATH}", self.base_url);
        let resp = self.http.post(&url).json(&EngineRequest { input }).send().await?;

        let status = resp.status();
        let body = read_capped(resp, MAX_POLICY_RESPONSE_BYTES).await?;
        if status.as_u16() != 200 {
            let snippet = String::from_utf8_lossy(&body[..body.len().min(512)]).into_owned();
            return Err(PolicyError::Status { status: status.as_u16(), snippet });
        }

        let envelope: EngineResponse = serde_json::from_slice(&body)?;
        let raw = envelope.result;

        let (decision, reason) = match Decision::parse(&raw.decision) {
            Some(decision) => (decision, raw.reason),
            None if raw.decision.is_empty() => (Decision::Deny, raw.reason),
            None => (Decision::Deny, "unrecognized policy decision".to_string()),
        };

        Ok(PolicyResult {
            decision,
            reason,
            requirements: raw.requirements,
            notify: raw.notify,
            approver_group: raw.approver_group,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PolicyEnvironment, ToolCallRequest};
    use axum::routing::post;
    use axum::{Json, Router};

    async fn spawn_engine(response: serde_json::Value) -> String {
        let app = Router::new().route(
            "/v1/data/oc/main",
            post(move || {
                let response = response.clone();
                async move { Json(response) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn input() -> PolicyInput {
        PolicyInput {
            toolcall: ToolCallRequest {
                tenant_id: "tenant1".into(),
                agent_id: "agent-1".into(),
                tool: "slack".into(),
                action: "msg.post".into(),
                idempotency_key: "k".into(),
                ..Default::default()
            },
            environment: PolicyEnvironment {
                timestamp: chrono::Utc::now(),
                tenant_config: Default::default(),
            },
        }
    }

    #[tokio::test]
    async fn parses_known_decisions() {
        let base = spawn_engine(serde_json::json!({
            "result": {"decision": "approve", "reason": "risk 8 >= 7",
                       "approver_group": "sec-ops",
                       "notify": [{"kind": "webhook", "url": "https://h.example/x"}]}
        }))
        .await;
        let client = PolicyClient::new(base).expect("client");
        let result = client.evaluate(&input()).await.expect("evaluate");
        assert_eq!(result.decision, Decision::Approve);
        assert_eq!(result.reason, "risk 8 >= 7");
        assert_eq!(result.approver_group, "sec-ops");
        assert_eq!(result.notify.len(), 1);
        assert_eq!(result.notify[0].kind, "webhook");
    }

    #[tokio::test]
    async fn empty_decision_becomes_deny() {
        let base = spawn_engine(serde_json::json!({"result": {"reason": "no rule matched"}})).await;
        let client = PolicyClient::new(base).expect("client");
        let result = client.evaluate(&input()).await.expect("evaluate");
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.reason, "no rule matched");
    }

    #[tokio::test]
    async fn unknown_decision_becomes_deny() {
        let base =
            spawn_engine(serde_json::json!({"result": {"decision": "escalate", "reason": "x"}}))
                .await;
        let client = PolicyClient::new(base).expect("client");
        let result = client.evaluate(&input()).await.expect("evaluate");
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.reason, "unrecognized policy decision");
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        // Nothing listens here.
        let client = PolicyClient::new("http://127.0.0.1:1").expect("client");
        assert!(client.evaluate(&input()).await.is_err());
    }
}
