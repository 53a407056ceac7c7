//! Environment-variable configuration for the services.
//!
//! Every knob has a development-friendly default; unparsable values log a
//! warning and fall back rather than aborting startup.

use std::collections::HashMap;
use std::time::Duration;

use secrecy::SecretString;

/// Returns the environment variable value or a fallback default.
#[must_use]
pub fn env_or(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => fallback.to_string(),
    }
}

/// Returns a positive integer environment variable or a fallback.
/// Non-numeric and non-positive values warn and fall back.
#[must_use]
pub fn env_or_u64(key: &str, fallback: u64) -> u64 {
    let value = match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => return fallback,
    };
    match value.parse::<u64>() {
        Ok(n) if n > 0 => n,
        _ => {
            tracing::warn!(key, value, fallback, "invalid integer env var, using fallback");
            fallback
        }
    }
}

/// Returns a boolean environment variable (`true`/`false`) or a fallback.
#[must_use]
pub fn env_or_bool(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value == "true",
        _ => fallback,
    }
}

/// Returns a secret-valued environment variable, absent when empty.
#[must_use]
pub fn env_secret(key: &str) -> Option<SecretString> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Some(SecretString::from(value)),
        _ => None,
    }
}

/// Parses `ref=secret` pairs from a comma-separated string into a map of
/// webhook signing secrets. Malformed entries are skipped.
#[must_use]
pub fn parse_secret_ref_map(raw: &str) -> HashMap<String, SecretString> {
    let mut out = HashMap::new();
    for pair in raw.split(',') {
        let Some((name, secret)) = pair.trim().split_once('=') else {
            continue;
        };
        let name = name.trim();
        let secret = secret.trim();
        if !name.is_empty() && !secret.is_empty() {
            out.insert(name.to_string(), SecretString::from(secret.to_string()));
        }
    }
    out
}

/// Gateway service configuration.
#[derive(Debug)]
pub struct GatewayConfig {
    /// Public listen address.
    pub addr: String,
    /// Internal-only metrics listen address.
    pub metrics_addr: String,
    /// SQLite database path shared by the services.
    pub db_path: String,
    /// Policy engine base URL.
    pub policy_url: String,
    /// Approvals service base URL (for approval links and request
    /// creation).
    pub approvals_url: String,
    /// Slack connector base URL.
    pub connector_slack_url: String,
    /// Jira connector base URL.
    pub connector_jira_url: String,
    /// Service-to-service auth token.
    pub internal_token: Option<SecretString>,
    /// Raw `tenant:key` API key specification.
    pub api_keys: String,
    /// Sustained per-tenant request rate per second.
    pub rate_limit_per_tenant: u64,
}

impl GatewayConfig {
    /// Reads the gateway configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            addr: env_or("GATEWAY_ADDR", "0.0.0.0:8080"),
            metrics_addr: env_or("METRICS_ADDR", "127.0.0.1:9090"),
            db_path: env_or("OC_DB_PATH", "openclause.db"),
            policy_url: env_or("OPA_URL", "http://localhost:8181"),
            approvals_url: env_or("APPROVALS_URL", "http://localhost:8081"),
            connector_slack_url: env_or("CONNECTOR_SLACK_URL", "http://localhost:8082"),
            connector_jira_url: env_or("CONNECTOR_JIRA_URL", "http://localhost:8083"),
            internal_token: env_secret("INTERNAL_AUTH_TOKEN"),
            api_keys: env_or("API_KEYS", ""),
            rate_limit_per_tenant: env_or_u64("RATE_LIMIT_PER_TENANT", 100),
        }
    }
}

/// Approvals service configuration.
#[derive(Debug)]
pub struct ApprovalsConfig {
    /// Public listen address.
    pub addr: String,
    /// Internal-only metrics listen address.
    pub metrics_addr: String,
    /// SQLite database path shared by the services.
    pub db_path: String,
    /// Service-to-service auth token.
    pub internal_token: Option<SecretString>,
    /// Slack request signing secret for the interaction callback.
    pub slack_signing_secret: Option<SecretString>,
    /// Webhook signing secrets by `secret_ref`.
    pub webhook_secrets: HashMap<String, SecretString>,
    /// Slack connector base URL for messenger deliveries.
    pub connector_slack_url: String,
    /// Per-tenant approver email allowlist.
    pub approver_email_allowlist: String,
    /// Per-tenant approver Slack-user allowlist.
    pub approver_slack_allowlist: String,
    /// Whether the notification dispatcher runs in this process.
    pub notifier_enabled: bool,
    /// Dispatcher tick interval.
    pub notifier_interval: Duration,
    /// CloudEvents source attribute for outgoing notifications.
    pub notifier_source: String,
}

impl ApprovalsConfig {
    /// Reads the approvals configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            addr: env_or("APPROVALS_ADDR", "0.0.0.0:8081"),
            metrics_addr: env_or("METRICS_ADDR", "127.0.0.1:9091"),
            db_path: env_or("OC_DB_PATH", "openclause.db"),
            internal_token: env_secret("INTERNAL_AUTH_TOKEN"),
            slack_signing_secret: env_secret("SLACK_SIGNING_SECRET"),
            webhook_secrets: parse_secret_ref_map(&env_or("WEBHOOK_SECRET_REFS", "")),
            connector_slack_url: env_or("CONNECTOR_SLACK_URL", "http://localhost:8082"),
            approver_email_allowlist: env_or("APPROVER_EMAIL_ALLOWLIST", ""),
            approver_slack_allowlist: env_or("APPROVER_SLACK_ALLOWLIST", ""),
            notifier_enabled: env_or_bool("APPROVALS_NOTIFIER_ENABLED", true),
            notifier_interval: Duration::from_secs(env_or_u64(
                "APPROVALS_NOTIFIER_INTERVAL_SEC",
                5,
            )),
            notifier_source: env_or("APPROVALS_NOTIFIER_SOURCE", "oc://approvals"),
        }
    }
}

/// Archiver service configuration.
#[derive(Debug)]
pub struct ArchiverConfig {
    /// SQLite database path shared by the services.
    pub db_path: String,
    /// S3-compatible endpoint, e.g. `localhost:9000`.
    pub s3_endpoint: String,
    /// Destination bucket.
    pub s3_bucket: String,
    /// Access key id.
    pub s3_access_key: String,
    /// Secret access key.
    pub s3_secret_key: Option<SecretString>,
    /// Signing region.
    pub s3_region: String,
    /// Whether to use HTTPS to the endpoint.
    pub s3_secure: bool,
    /// Archive pass interval when running continuously.
    pub interval: Duration,
    /// Run a single pass and exit.
    pub run_once: bool,
    /// Restrict the pass to one tenant; empty archives all tenants.
    pub tenant_id: String,
}

impl ArchiverConfig {
    /// Reads the archiver configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            db_path: env_or("OC_DB_PATH", "openclause.db"),
            s3_endpoint: env_or("EVIDENCE_S3_ENDPOINT", "localhost:9000"),
            s3_bucket: env_or("EVIDENCE_S3_BUCKET", "openclause-evidence"),
            s3_access_key: env_or("EVIDENCE_S3_ACCESS_KEY", "minioadmin"),
            s3_secret_key: env_secret("EVIDENCE_S3_SECRET_KEY"),
            s3_region: env_or("EVIDENCE_S3_REGION", "us-east-1"),
            s3_secure: env_or_bool("EVIDENCE_S3_SECURE", false),
            interval: Duration::from_secs(env_or_u64("ARCHIVER_INTERVAL_SEC", 300)),
            run_once: env_or_bool("ARCHIVER_RUN_ONCE", true),
            tenant_id: env_or("ARCHIVER_TENANT_ID", ""),
        }
    }
}
