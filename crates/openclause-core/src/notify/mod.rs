//! Notification dispatcher for the approval outbox.
//!
//! The outbox is the only durable message queue in the system: rows are
//! written in the same transaction as the approval request they announce,
//! then claimed and delivered here. Delivery is at-least-once until the
//! attempt cap, then terminal failure; consumers are expected to
//! deduplicate on the event id.
//!
//! Webhook deliveries are CloudEvents 1.0 bodies signed with
//! HMAC-SHA256 over the exact transmitted bytes. Destination URLs pass an
//! SSRF guard (HTTPS only, no loopback/private/link-local hosts) before
//! any bytes leave the process.

mod event;


pub use event::{build_approval_event, summarize, APPROVAL_EVENT_TYPE};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;
use url::Url;

use crate::approvals::{ApprovalError, ApprovalStore, NotificationOutbox};
use crate::connectors::{ExecRequest, ExecResponse, INTERNAL_TOKEN_HEADER};

/// Delivery attempts before an outbox row fails terminally.
pub const MAX_NOTIFICATION_ATTEMPTS: i64 = 10;

/// Upper bound on retry backoff.
pub const MAX_DISPATCH_BACKOFF: Duration = Duration::from_secs(300);

/// Rows claimed per dispatch tick.
const DISPATCH_BATCH_SIZE: i64 = 100;

/// Outbound delivery deadline.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Signature header attached to signed webhook deliveries.
pub const SIGNATURE_HEADER: &str = "X-OC-Signature-256";

/// Errors raised while delivering notifications.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The destination URL failed the SSRF guard.
    #[error("webhook URL validation: {0}")]
    InvalidUrl(String),

    /// The delivery could not be sent or the response not read.
    #[error("delivery transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// The destination answered with a non-2xx status.
    #[error("delivery status={0}")]
    Status(u16),

    /// The messenger connector accepted the call but reported failure.
    #[error("messenger delivery failed: {0}")]
    Messenger(String),

    /// The notification body could not be serialized.
    #[error("event serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The outbox store failed.
    #[error(transparent)]
    Store(#[from] ApprovalError),
}

/// The slice of the approval store the dispatcher consumes.
pub trait OutboxStore: Send + Sync {
    /// Atomically claims due rows for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn claim_due_notifications(&self, limit: i64) -> Result<Vec<NotificationOutbox>, ApprovalError>;

    /// Marks a row delivered.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn mark_notification_sent(&self, id: &str) -> Result<(), ApprovalError>;

    /// Schedules a retry.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn mark_notification_retry(
        &self,
        id: &str,
        attempt_count: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), ApprovalError>;

    /// Marks a row terminally failed.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn mark_notification_failed(&self, id: &str, last_error: &str) -> Result<(), ApprovalError>;
}

impl OutboxStore for ApprovalStore {
    fn claim_due_notifications(&self, limit: i64) -> Result<Vec<NotificationOutbox>, ApprovalError> {
        Self::claim_due_notifications(self, limit)
    }

    fn mark_notification_sent(&self, id: &str) -> Result<(), ApprovalError> {
        Self::mark_notification_sent(self, id)
    }

    fn mark_notification_retry(
        &self,
        id: &str,
        attempt_count: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), ApprovalError> {
        Self::mark_notification_retry(self, id, attempt_count, next_attempt_at, last_error)
    }

    fn mark_notification_failed(&self, id: &str, last_error: &str) -> Result<(), ApprovalError> {
        Self::mark_notification_failed(self, id, last_error)
    }
}

/// Counts from one dispatch tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Rows claimed this tick.
    pub claimed: usize,
    /// Rows delivered and marked sent.
    pub sent: usize,
    /// Rows rescheduled for another attempt.
    pub retried: usize,
    /// Rows marked terminally failed.
    pub failed: usize,
}

enum Delivery {
    Delivered,
    Retryable(String),
    Terminal(String),
}

/// Polls the outbox and delivers notifications.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    http: reqwest::Client,
    source: String,
    secrets: HashMap<String, SecretString>,
    slack_url: String,
    internal_token: Option<SecretString>,
    validate_urls: bool,
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// `source` becomes the CloudEvents `source` attribute; `secrets`
    /// maps `secret_ref` names to webhook signing secrets; `slack_url` is
    /// the messenger connector's base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        source: impl Into<String>,
        secrets: HashMap<String, SecretString>,
        slack_url: impl Into<String>,
        internal_token: Option<SecretString>,
    ) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder().timeout(DELIVERY_TIMEOUT).build()?;
        let slack_url: String = slack_url.into();
        Ok(Self {
            store,
            http,
            source: source.into(),
            secrets,
            slack_url: slack_url.trim_end_matches('/').to_string(),
            internal_token,
            validate_urls: true,
        })
    }

    /// Disables the SSRF URL guard. Tests only: lets deliveries target
    /// loopback listeners.
    #[must_use]
    pub fn skip_url_validation(mut self) -> Self {
        self.validate_urls = false;
        self
    }

    /// Claims one batch of due notifications and delivers them.
    ///
    /// Delivery failures are absorbed into retry/fail bookkeeping and
    /// never propagate; only a claim failure is an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the outbox claim itself fails.
    pub async fn dispatch_once(&self) -> Result<DispatchStats, NotifyError> {
        let claimed = self.store.claim_due_notifications(DISPATCH_BATCH_SIZE)?;
        let mut stats = DispatchStats { claimed: claimed.len(), ..DispatchStats::default() };

        for item in claimed {
            let delivery = match item.notify_kind.as_str() {
                "webhook" if item.notify_url.is_empty() => {
                    Delivery::Terminal("webhook notify_url is empty".to_string())
                }
                "webhook" => self.deliver_webhook(&item).await,
                "slack" if item.slack_channel.is_empty() => {
                    Delivery::Terminal("slack channel is empty".to_string())
                }
                "slack" => self.deliver_slack(&item).await,
                other => Delivery::Terminal(format!("unsupported notify kind {other:?}")),
            };

            match delivery {
                Delivery::Delivered => {
                    if let Err(e) = self.store.mark_notification_sent(&item.id) {
                        tracing::error!(id = %item.id, error = %e, "mark notification sent failed");
                    }
                    stats.sent += 1;
                }
                Delivery::Retryable(reason) if item.attempt_count >= MAX_NOTIFICATION_ATTEMPTS => {
                    let detail = format!("max retries exceeded: {reason}");
                    if let Err(e) = self.store.mark_notification_failed(&item.id, &detail) {
                        tracing::error!(id = %item.id, error = %e, "mark notification failed errored");
                    }
                    stats.failed += 1;
                }
                Delivery::Retryable(reason) => {
                    let next = Utc::now()
                        + chrono::Duration::from_std(backoff_for_attempt(item.attempt_count))
                            .unwrap_or(chrono::Duration::seconds(1));
                    if let Err(e) = self.store.mark_notification_retry(
                        &item.id,
                        item.attempt_count,
                        next,
                        &reason,
                    ) {
                        tracing::error!(id = %item.id, error = %e, "mark notification retry failed");
                    }
                    tracing::warn!(
                        id = %item.id,
                        kind = %item.notify_kind,
                        attempt = item.attempt_count,
                        reason = %reason,
                        "notification delivery failed, retrying"
                    );
                    stats.retried += 1;
                }
                Delivery::Terminal(reason) => {
                    if let Err(e) = self.store.mark_notification_failed(&item.id, &reason) {
                        tracing::error!(id = %item.id, error = %e, "mark notification failed errored");
                    }
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn deliver_webhook(&self, item: &NotificationOutbox) -> Delivery {
        if self.validate_urls {
            if let Err(e) = validate_webhook_url(&item.notify_url) {
                return Delivery::Retryable(e.to_string());
            }
        }
        let body = match build_approval_event(item, &self.source, &summarize(item)) {
            Ok(body) => body,
            Err(e) => return Delivery::Terminal(format!("event serialization: {e}")),
        };

        let mut builder = self
            .http
            .post(&item.notify_url)
            .header("Content-Type", "application/cloudevents+json")
            .header("Ce-Specversion", "1.0")
            .header("Ce-Type", APPROVAL_EVENT_TYPE)
            .header("Ce-Id", &item.id)
            .header("Ce-Source", &self.source);
        if !item.trace_id.is_empty() {
            builder = builder.header("X-Trace-Id", &item.trace_id);
        }
        if let Some(secret) = self.secrets.get(&item.secret_ref) {
            // Signed over the exact bytes that go on the wire.
            builder = builder.header(SIGNATURE_HEADER, sign_body(secret, &body));
        }

        match builder.body(body).send().await {
            Ok(resp) if resp.status().is_success() => Delivery::Delivered,
            Ok(resp) => Delivery::Retryable(format!("webhook status={}", resp.status().as_u16())),
            Err(e) => Delivery::Retryable(format!("webhook transport: {e}")),
        }
    }

    async fn deliver_slack(&self, item: &NotificationOutbox) -> Delivery {
        if self.slack_url.is_empty() {
            return Delivery::Retryable("slack connector url is empty".to_string());
        }
        let params = serde_json::json!({
            "channel": item.slack_channel,
            "tool": item.tool,
            "action": item.action,
            "resource": item.resource,
            "risk_score": item.risk_score,
            "risk_factors": item.risk_factors,
            "reason": item.reason,
            "approval_url": item.approval_url,
            "approval_request_id": item.approval_request_id,
            "event_id": item.event_id,
            "tenant_id": item.tenant_id,
        });
        let exec = ExecRequest {
            event_id: item.event_id.clone(),
            tenant_id: item.tenant_id.clone(),
            agent_id: String::new(),
            tool: "slack".to_string(),
            action: "approval.request".to_string(),
            params: Some(params),
            resource: item.resource.clone(),
        };

        let mut builder = self.http.post(format!("{}/exec", self.slack_url)).json(&exec);
        if let Some(token) = &self.internal_token {
            builder = builder.header(INTERNAL_TOKEN_HEADER, token.expose_secret());
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => return Delivery::Retryable(format!("slack transport: {e}")),
        };
        if !resp.status().is_success() {
            return Delivery::Retryable(format!("slack connector status={}", resp.status().as_u16()));
        }
        match resp.json::<ExecResponse>().await {
            Ok(exec_resp) if exec_resp.status == "success" => Delivery::Delivered,
            Ok(exec_resp) => {
                Delivery::Retryable(format!("slack delivery failed: {}", exec_resp.error))
            }
            Err(e) => Delivery::Retryable(format!("slack decode: {e}")),
        }
    }
}

/// Signs a webhook body: `sha256=<hex(HMAC-SHA256(secret, body))>`.
#[must_use]
pub fn sign_body(secret: &SecretString, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// SSRF guard for webhook destinations: HTTPS only, and IP-literal hosts
/// must not be loopback, private, link-local, or unspecified.
///
/// # Errors
///
/// Returns [`NotifyError::InvalidUrl`] describing the violation.
pub fn validate_webhook_url(raw: &str) -> Result<(), NotifyError> {
    let url = Url::parse(raw).map_err(|e| NotifyError::InvalidUrl(format!("invalid URL: {e}")))?;
    if url.scheme() != "https" {
        return Err(NotifyError::InvalidUrl(format!(
            "only https scheme allowed, got {:?}",
            url.scheme()
        )));
    }
    let Some(host) = url.host_str() else {
        return Err(NotifyError::InvalidUrl("empty hostname".to_string()));
    };
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(NotifyError::InvalidUrl(format!(
                "private/loopback IP not allowed: {ip}"
            )));
        }
    }
    Ok(())
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Exponential backoff for the given attempt number, capped at
/// [`MAX_DISPATCH_BACKOFF`].
#[must_use]
pub fn backoff_for_attempt(attempt: i64) -> Duration {
    if attempt <= 0 {
        return Duration::from_secs(1);
    }
    let exp = attempt.min(8) as u32;
    MAX_DISPATCH_BACKOFF.min(Duration::from_secs(1 << exp))
}
