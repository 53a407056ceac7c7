//! The canonical tool-call schema shared by all services.
//!
//! [`ToolCallRequest`] is the payload an AI agent submits; it is validated
//! and normalized at ingress and never persisted directly. The persisted
//! form is [`ToolCallEnvelope`], which wraps the request with identifiers,
//! timestamps, the policy decision, and the hash-chain linkage fields.

mod error;

pub use error::{ApiError, ValidationError};

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum serialized size of `params` in bytes (64 KiB).
pub const MAX_PARAMS_BYTES: usize = 64 * 1024;

/// Maximum size of `resource` in bytes (2 KiB).
pub const MAX_RESOURCE_BYTES: usize = 2 * 1024;

/// Maximum size of `idempotency_key` in bytes.
pub const MAX_IDEMPOTENCY_KEY_BYTES: usize = 256;

/// Maximum number of `labels` entries.
pub const MAX_LABELS_COUNT: usize = 50;

/// Maximum permitted risk score.
pub const MAX_RISK_SCORE: i64 = 10;

/// The only schema version this build understands.
pub const CURRENT_SCHEMA_VERSION: &str = "1.0";

/// Normalized tool/action tokens: lowercase alphanumeric with `.`, `_`,
/// `-` separators, at most 64 bytes.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").expect("token pattern"));

/// The payload sent by an AI agent to request a tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Owning tenant. Overridden by the authenticated tenant at ingress.
    pub tenant_id: String,
    /// Requesting agent.
    pub agent_id: String,

    /// Tool name, e.g. `slack`. Lowercased on normalization.
    pub tool: String,
    /// Action name, e.g. `msg.post`. Lowercased on normalization.
    pub action: String,

    /// Opaque tool parameters, byte-bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,

    /// Target resource identifier, e.g. a channel or project key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,

    /// Caller-asserted risk score in `0..=10`.
    #[serde(default)]
    pub risk_score: i64,
    /// Free-form risk factor labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_factors: Vec<String>,

    /// End-user attribution, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    /// Agent session attribution, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    /// Caller-supplied labels, bounded by [`MAX_LABELS_COUNT`].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Originating IP as reported by the caller.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_ip: String,
    /// Distributed-trace correlation id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,

    /// Caller-supplied dedup token, unique per tenant.
    pub idempotency_key: String,
    /// When the caller produced the request. Defaulted to now on validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
    /// Request schema version; must be [`CURRENT_SCHEMA_VERSION`].
    #[serde(default)]
    pub schema_version: String,
}

impl ToolCallRequest {
    /// Lowercases and trims the tool and action tokens.
    pub fn normalize(&mut self) {
        self.tool = self.tool.trim().to_lowercase();
        self.action = self.action.trim().to_lowercase();
    }

    /// Normalizes, then enforces every bound on the request.
    ///
    /// Missing `schema_version` and `requested_at` are defaulted rather
    /// than rejected.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the first violating field.
    pub fn normalize_and_validate(&mut self) -> Result<(), ValidationError> {
        self.normalize();

        if self.tenant_id.is_empty() {
            return Err(ValidationError::required("tenant_id"));
        }
        if self.agent_id.is_empty() {
            return Err(ValidationError::required("agent_id"));
        }
        if self.tool.is_empty() {
            return Err(ValidationError::required("tool"));
        }
        if self.action.is_empty() {
            return Err(ValidationError::required("action"));
        }
        if !TOKEN_RE.is_match(&self.tool) {
            return Err(ValidationError::new("tool", "must match [a-z0-9][a-z0-9._-]{0,63}"));
        }
        if !TOKEN_RE.is_match(&self.action) {
            return Err(ValidationError::new("action", "must match [a-z0-9][a-z0-9._-]{0,63}"));
        }
        if self.idempotency_key.is_empty() {
            return Err(ValidationError::required("idempotency_key"));
        }
        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_BYTES {
            return Err(ValidationError::new(
                "idempotency_key",
                format!("exceeds {MAX_IDEMPOTENCY_KEY_BYTES} bytes"),
            ));
        }
        if self.risk_score < 0 || self.risk_score > MAX_RISK_SCORE {
            return Err(ValidationError::new(
                "risk_score",
                format!("must be 0..={MAX_RISK_SCORE}"),
            ));
        }
        if let Some(params) = &self.params {
            let size = serde_json::to_vec(params).map(|b| b.len()).unwrap_or(usize::MAX);
            if size > MAX_PARAMS_BYTES {
                return Err(ValidationError::new(
                    "params",
                    format!("exceeds {MAX_PARAMS_BYTES} bytes"),
                ));
            }
        }
        if self.resource.len() > MAX_RESOURCE_BYTES {
            return Err(ValidationError::new(
                "resource",
                format!("exceeds {MAX_RESOURCE_BYTES} bytes"),
            ));
        }
        if self.labels.len() > MAX_LABELS_COUNT {
            return Err(ValidationError::new(
                "labels",
                format!("exceeds {MAX_LABELS_COUNT} entries"),
            ));
        }
        if self.schema_version.is_empty() {
            self.schema_version = CURRENT_SCHEMA_VERSION.to_string();
        } else if self.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(ValidationError::new(
                "schema_version",
                format!(
                    "unsupported version {:?}, expected {CURRENT_SCHEMA_VERSION:?}",
                    self.schema_version
                ),
            ));
        }
        if self.requested_at.is_none() {
            self.requested_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Returns the combined `tool.action` token.
    #[must_use]
    pub fn tool_action(&self) -> String {
        format!("{}.{}", self.tool, self.action)
    }
}

/// The authoritative output of policy evaluation for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Execute immediately.
    Allow,
    /// Refuse; record evidence and return the reason.
    Deny,
    /// Hold for human approval; execution resumes via a grant.
    Approve,
}

impl Decision {
    /// The wire string for this decision.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Approve => "approve",
        }
    }

    /// Parses a wire string, returning `None` for anything outside the
    /// closed set.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "approve" => Some(Self::Approve),
            _ => None,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input sent to the external policy engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInput {
    /// The normalized request under evaluation.
    pub toolcall: ToolCallRequest,
    /// Evaluation environment.
    pub environment: PolicyEnvironment,
}

/// Ambient facts the policy engine may consult.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEnvironment {
    /// Evaluation time.
    pub timestamp: DateTime<Utc>,
    /// Per-tenant configuration options (e.g. `max_risk_auto_approve`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tenant_config: BTreeMap<String, String>,
}

/// A notification route attached to an approve decision by policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyRoute {
    /// Delivery kind: `webhook` or `slack`. Anything else is rejected by
    /// the dispatcher, not at parse time — policy is an external system.
    #[serde(default)]
    pub kind: String,
    /// Destination URL for webhook routes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Name of the shared secret used to sign webhook deliveries.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_ref: String,
    /// Destination channel for messenger routes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
}

/// What the policy engine returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyResult {
    /// The validated decision.
    pub decision: Decision,
    /// Human-readable rationale.
    #[serde(default)]
    pub reason: String,
    /// Opaque requirements the policy attaches to the decision.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, String>,
    /// Notification routes to enqueue when the decision is approve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<NotifyRoute>,
    /// Opaque approver-group tag carried onto outbox rows.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approver_group: String,
}

impl PolicyResult {
    /// A deny result with the given reason and nothing else.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
            requirements: BTreeMap::new(),
            notify: Vec::new(),
            approver_group: String::new(),
        }
    }

    /// An allow result with the given reason.
    #[must_use]
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
            requirements: BTreeMap::new(),
            notify: Vec::new(),
            approver_group: String::new(),
        }
    }
}

/// Terminal status of a connector execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    /// The connector completed the action.
    Success,
    /// The connector (or transport) reported a failure.
    Error,
    /// The connector exceeded its deadline.
    Timeout,
}

impl ExecStatus {
    /// The wire string for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    /// Parses a wire string; unknown values collapse to `Error`.
    #[must_use]
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "timeout" => Self::Timeout,
            _ => Self::Error,
        }
    }
}

/// Outcome of one connector execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Terminal status.
    pub status: ExecStatus,
    /// Connector output payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_json: Option<serde_json::Value>,
    /// Error detail for non-success outcomes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Wall-clock duration of the connector call in milliseconds.
    pub duration_ms: i64,
}

/// A persisted audit-chain entry: request, decision, and chain linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEnvelope {
    /// Dense per-store sequence number, assigned at insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_seq: Option<i64>,
    /// Opaque event identifier (UUID v4).
    pub event_id: String,
    /// The stored request.
    pub request: ToolCallRequest,
    /// When the gateway accepted the request.
    pub received_at: DateTime<Utc>,
    /// The recorded decision.
    pub decision: Decision,
    /// The full policy result, when evaluation ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_result: Option<PolicyResult>,
    /// The execution result, present only for allow events that executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    /// This event's chain hash (hex SHA-256).
    #[serde(default)]
    pub hash: String,
    /// The prior event's chain hash, empty at the chain head.
    #[serde(default)]
    pub prev_hash: String,
}

impl ToolCallEnvelope {
    /// Builds an unrecorded envelope around a request. Hash fields are
    /// populated by the evidence store at commit.
    #[must_use]
    pub fn new(event_id: impl Into<String>, request: ToolCallRequest) -> Self {
        Self {
            event_seq: None,
            event_id: event_id.into(),
            request,
            received_at: Utc::now(),
            decision: Decision::Deny,
            policy_result: None,
            execution_result: None,
            hash: String::new(),
            prev_hash: String::new(),
        }
    }
}

/// The gateway's response to a submitted tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    /// Identifier of the recorded event.
    pub event_id: String,
    /// The decision the caller must act on.
    pub decision: Decision,
    /// Rationale, when one exists.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Where to review the approval, for approve decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    /// The execution result, for allow decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}
