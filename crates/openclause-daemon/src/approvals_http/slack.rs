//! Slack interaction callback: signed button presses from approval
//! messages.
//!
//! Slack signs each request as `v0=hex(HMAC-SHA256(secret,
//! "v0:" + timestamp + ":" + raw_body))`. The body is a form-encoded
//! `payload` field carrying a block-actions interaction whose action
//! value encodes `decision|approval_request_id|event_id|tenant_id`.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use openclause_core::approvals::{DenyInput, GrantInput};
use openclause_core::types::ApiError;

use super::{approval_error, ApprovalsState};

/// Permitted clock skew between Slack's timestamp and ours.
const MAX_TIMESTAMP_SKEW_SECS: i64 = 5 * 60;

/// Verifies a Slack request signature in constant time, rejecting
/// timestamps skewed more than five minutes.
#[must_use]
pub fn verify_slack_signature(
    raw_body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    secret: &SecretString,
    now: DateTime<Utc>,
) -> bool {
    if signature_header.is_empty() || timestamp_header.is_empty() {
        return false;
    }
    let Ok(timestamp) = timestamp_header.parse::<i64>() else {
        return false;
    };
    if (now.timestamp() - timestamp).abs() > MAX_TIMESTAMP_SKEW_SECS {
        return false;
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
        .expect("hmac accepts any key length");
    mac.update(b"v0:");
    mac.update(timestamp_header.as_bytes());
    mac.update(b":");
    mac.update(raw_body);
    let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));
    expected.as_bytes().ct_eq(signature_header.as_bytes()).into()
}

#[derive(Deserialize)]
struct InteractionForm {
    #[serde(default)]
    payload: String,
}

#[derive(Deserialize)]
struct Interaction {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    user: InteractionUser,
    #[serde(default)]
    actions: Vec<InteractionAction>,
}

#[derive(Default, Deserialize)]
struct InteractionUser {
    #[serde(default)]
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct InteractionAction {
    #[serde(default)]
    value: String,
}

/// `POST /v1/integrations/slack/interactions`.
pub(super) async fn interactions(
    State(state): State<ApprovalsState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(secret) = &state.slack_signing_secret else {
        return Err(ApiError::Unauthorized("slack integration is not configured".to_string()));
    };
    let signature = headers
        .get("X-Slack-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let timestamp = headers
        .get("X-Slack-Request-Timestamp")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_slack_signature(&body, signature, timestamp, secret, Utc::now()) {
        return Err(ApiError::Unauthorized("invalid slack signature".to_string()));
    }

    let form: InteractionForm = serde_urlencoded::from_bytes(&body)
        .map_err(|_| ApiError::BadRequest("invalid form body".to_string()))?;
    if form.payload.is_empty() {
        return Err(ApiError::BadRequest("missing payload".to_string()));
    }
    let interaction: Interaction = serde_json::from_str(&form.payload)
        .map_err(|_| ApiError::BadRequest("invalid interaction payload".to_string()))?;
    if interaction.kind != "block_actions" || interaction.actions.is_empty() {
        return Err(ApiError::BadRequest("unsupported interaction type".to_string()));
    }

    let mut parts = interaction.actions[0].value.split('|');
    let (Some(decision), Some(request_id), Some(action_event_id), Some(_tenant), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(ApiError::BadRequest("invalid action value".to_string()));
    };

    let request = state
        .store
        .get_request(request_id)
        .map_err(|e| approval_error(e, "process interaction"))?
        .ok_or_else(|| ApiError::NotFound("approval request not found".to_string()))?;
    if !action_event_id.is_empty() && request.event_id != action_event_id {
        return Err(ApiError::BadRequest("interaction event mismatch".to_string()));
    }
    if !state.authorizer.allow_slack(&request.tenant_id, &interaction.user.id) {
        return Err(ApiError::Forbidden("slack user is not allowed for tenant".to_string()));
    }

    let approver = format!("slack:{}", interaction.user.id);
    let verb = match decision {
        "approve" => {
            state
                .store
                .grant_request(
                    request_id,
                    &GrantInput { approver: approver.clone(), max_uses: 1, ..Default::default() },
                )
                .map_err(|e| approval_error(e, "process interaction"))?;
            "Approved"
        }
        "deny" => {
            state
                .store
                .deny_request(
                    request_id,
                    &DenyInput { approver: approver.clone(), reason: "denied from Slack".into() },
                )
                .map_err(|e| approval_error(e, "process interaction"))?;
            "Denied"
        }
        _ => return Err(ApiError::BadRequest("unknown action".to_string())),
    };

    let username = [&interaction.user.username, &interaction.user.name, &interaction.user.id]
        .into_iter()
        .find(|v| !v.is_empty())
        .cloned()
        .unwrap_or_default();
    tracing::info!(
        request_id = %request_id,
        tenant_id = %request.tenant_id,
        approver = %approver,
        decision = %decision,
        "slack interaction processed"
    );
    Ok(Json(serde_json::json!({
        "text": format!("{verb} by @{username}"),
        "replace_original": true,
    })))
}
