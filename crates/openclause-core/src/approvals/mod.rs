//! The approval plane: request lifecycle, grant issuance and consumption,
//! and the transactional notification outbox.
//!
//! An approval request is created pending when policy says `approve`, in
//! the same transaction as its outbox rows. A human (or messenger
//! interaction) transitions it to approved — minting a scoped, bounded-use
//! [`ApprovalGrant`] — or denied. The gateway later consumes a matching
//! grant atomically to resume execution.

mod authorizer;
mod glob;
mod store;

#[cfg(test)]
mod tests;

pub use authorizer::ApproverAuthorizer;
pub use glob::match_resource;
pub use store::{build_approval_url, ApprovalError, ApprovalStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::NotifyRoute;

/// Lifecycle states of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved; a grant was minted in the same transaction.
    Approved,
    /// Denied by an approver.
    Denied,
    /// Past `expires_at` without a decision. Terminal.
    Expired,
}

impl ApprovalStatus {
    /// The wire string for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }
}

/// A pending-or-decided approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identifier (UUID v4).
    pub id: String,
    /// The approve-decision event this request gates.
    pub event_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Requesting agent.
    pub agent_id: String,
    /// Tool under approval.
    pub tool: String,
    /// Action under approval.
    pub action: String,
    /// Target resource.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    /// Risk score carried from the request.
    pub risk_score: i64,
    /// Policy rationale for requiring approval.
    pub reason: String,
    /// Denier's rationale, set on deny.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deny_reason: String,
    /// Identity that denied, set on deny.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub denied_by: String,
    /// Current lifecycle state.
    pub status: ApprovalStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Hard deadline after which the request can no longer be decided.
    pub expires_at: DateTime<Utc>,
}

/// What a grant authorizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalScope {
    /// Tool, exact or `*`.
    pub tool: String,
    /// Action, exact or `*`.
    pub action: String,
    /// Portable glob over resources.
    #[serde(default)]
    pub resource_pattern: String,
    /// Tenant the grant belongs to.
    pub tenant_id: String,
    /// Optional agent restriction; empty means any agent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
}

/// A scoped, bounded-use authorization minted on approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGrant {
    /// Grant identifier (UUID v4).
    pub id: String,
    /// The approval request this grant satisfies.
    pub request_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Identity of the approver.
    pub approver: String,
    /// What the grant authorizes.
    pub scope: ApprovalScope,
    /// Total permitted uses.
    pub max_uses: i64,
    /// Remaining uses.
    pub uses_left: i64,
    /// Expiry of the grant itself.
    pub expires_at: DateTime<Utc>,
    /// When the grant was minted.
    pub granted_at: DateTime<Utc>,
}

/// Input to create an approval request with its notification routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateApprovalInput {
    /// The approve-decision event id.
    pub event_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Requesting agent.
    #[serde(default)]
    pub agent_id: String,
    /// Tool under approval.
    pub tool: String,
    /// Action under approval.
    pub action: String,
    /// Target resource.
    #[serde(default)]
    pub resource: String,
    /// Risk score carried from the request.
    #[serde(default)]
    pub risk_score: i64,
    /// Risk factor labels for notifications.
    #[serde(default)]
    pub risk_factors: Vec<String>,
    /// Policy rationale.
    #[serde(default)]
    pub reason: String,
    /// Trace correlation id.
    #[serde(default)]
    pub trace_id: String,
    /// Opaque approver-group tag.
    #[serde(default)]
    pub approver_group: String,
    /// Notification routes to enqueue, one outbox row each.
    #[serde(default)]
    pub notify: Vec<NotifyRoute>,
    /// Base URL used to build the human approval link.
    #[serde(default)]
    pub approval_base_url: String,
}

/// Input to approve a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantInput {
    /// Identity of the approver.
    pub approver: String,
    /// Permitted uses; values below 1 default to 1.
    #[serde(default)]
    pub max_uses: i64,
    /// Grant lifetime in seconds from now; defaults to one hour.
    #[serde(default)]
    pub expires_in_sec: i64,
    /// Overrides the grant's resource pattern; defaults to the request's
    /// exact resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pattern: Option<String>,
}

/// Input to deny a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenyInput {
    /// Identity of the denier.
    pub approver: String,
    /// Denier's rationale.
    #[serde(default)]
    pub reason: String,
}

/// Delivery progression of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Due (or scheduled) for delivery.
    Pending,
    /// Claimed by a dispatcher.
    Processing,
    /// Delivered (2xx acknowledged).
    Sent,
    /// Terminally failed after the retry cap.
    Failed,
}

impl OutboxStatus {
    /// The wire string for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// A durable notification awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationOutbox {
    /// Outbox row identifier (UUID v4), also the CloudEvent id.
    pub id: String,
    /// The approval request being notified about.
    pub approval_request_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// The gated event id.
    pub event_id: String,
    /// Trace correlation id.
    #[serde(default)]
    pub trace_id: String,
    /// Tool under approval.
    pub tool: String,
    /// Action under approval.
    pub action: String,
    /// Target resource.
    #[serde(default)]
    pub resource: String,
    /// Risk score carried from the request.
    pub risk_score: i64,
    /// Risk factor labels.
    #[serde(default)]
    pub risk_factors: Vec<String>,
    /// Policy rationale.
    #[serde(default)]
    pub reason: String,
    /// Opaque approver-group tag.
    #[serde(default)]
    pub approver_group: String,
    /// Human approval link.
    #[serde(default)]
    pub approval_url: String,
    /// Delivery kind: `webhook` or `slack`.
    pub notify_kind: String,
    /// Webhook destination URL.
    #[serde(default)]
    pub notify_url: String,
    /// Name of the signing secret for webhook delivery.
    #[serde(default)]
    pub secret_ref: String,
    /// Messenger channel for slack delivery.
    #[serde(default)]
    pub slack_channel: String,
    /// Delivery progression.
    pub status: OutboxStatus,
    /// Attempts so far, including the in-flight one.
    pub attempt_count: i64,
    /// Earliest time of the next delivery attempt.
    pub next_attempt_at: DateTime<Utc>,
    /// Last delivery error, if any.
    #[serde(default)]
    pub last_error: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}
