//! CloudEvents body for approval-requested notifications.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::approvals::NotificationOutbox;

/// CloudEvents `type` attribute for approval requests.
pub const APPROVAL_EVENT_TYPE: &str = "oc.approval.requested";

#[derive(Serialize)]
struct CloudEvent<'a> {
    specversion: &'static str,
    id: &'a str,
    #[serde(rename = "type")]
    event_type: &'static str,
    source: &'a str,
    time: String,
    datacontenttype: &'static str,
    data: serde_json::Value,
}

/// Builds a deterministic, human-friendly summary from sanitized fields.
/// No model inference is involved.
#[must_use]
pub fn summarize(n: &NotificationOutbox) -> String {
    format!(
        "Approval requested: {}.{} on {} (risk={}, reason={})",
        n.tool, n.action, n.resource, n.risk_score, n.reason
    )
}

/// Serializes the CloudEvents 1.0 structured body for an outbox row.
/// The returned bytes are exactly what goes on the wire (and what gets
/// signed).
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn build_approval_event(
    n: &NotificationOutbox,
    source: &str,
    summary: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let event = CloudEvent {
        specversion: "1.0",
        id: &n.id,
        event_type: APPROVAL_EVENT_TYPE,
        source,
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        datacontenttype: "application/json",
        data: serde_json::json!({
            "approval_request_id": n.approval_request_id,
            "event_id": n.event_id,
            "tenant_id": n.tenant_id,
            "tool": n.tool,
            "action": n.action,
            "resource": n.resource,
            "risk_score": n.risk_score,
            "risk_factors": n.risk_factors,
            "approval_url": n.approval_url,
            "created_at": n.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "trace_id": n.trace_id,
            "approver_group": n.approver_group,
            "summary": summary,
            "raw": {
                "reason": n.reason,
            },
        }),
    };
    serde_json::to_vec(&event)
}
