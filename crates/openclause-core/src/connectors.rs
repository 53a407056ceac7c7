//! Tool connector registry and execution client.
//!
//! Connectors are external processes exposing a single `POST /exec`
//! endpoint. The registry maps tool names to base URLs and executes calls
//! with an internal-auth header, a per-call deadline, and a capped
//! response read. Routes, timeout, and token are all captured under one
//! read-lock acquisition per call, so a concurrent reconfiguration can
//! never produce a partial view.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::httpbody::{read_capped, BodyError};

/// Default per-call connector deadline.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector response body cap.
const MAX_CONNECTOR_RESPONSE_BYTES: usize = 4 << 20;

/// Length of the body snippet carried in error messages.
const ERROR_SNIPPET_BYTES: usize = 512;

/// Header carrying the shared service-to-service token.
pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

/// The request body POSTed to a connector's `/exec` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Evidence event this execution belongs to.
    pub event_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Requesting agent.
    #[serde(default)]
    pub agent_id: String,
    /// Tool to execute.
    pub tool: String,
    /// Action to execute.
    pub action: String,
    /// Opaque tool parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Target resource.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
}

/// What a connector answered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResponse {
    /// `success` or `error`.
    #[serde(default)]
    pub status: String,
    /// Connector output payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_json: Option<serde_json::Value>,
    /// Error detail for non-success outcomes.
    #[serde(default)]
    pub error: String,
}

/// Errors from one connector execution.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// No connector is registered for the tool.
    #[error("no connector registered for tool {tool:?}")]
    NoRoute {
        /// The unrouted tool.
        tool: String,
    },

    /// The connector exceeded its deadline.
    #[error("connector {tool} timed out")]
    Timeout {
        /// The tool whose connector timed out.
        tool: String,
    },

    /// The request could not be sent or the response not read.
    #[error("connector request to {tool}: {source}")]
    Transport {
        /// The tool being executed.
        tool: String,
        /// Underlying transport error.
        source: reqwest::Error,
    },

    /// The connector answered with a non-2xx status.
    #[error("connector {tool} returned HTTP {status}: {snippet}")]
    Status {
        /// The tool being executed.
        tool: String,
        /// HTTP status code.
        status: u16,
        /// Bounded body snippet.
        snippet: String,
    },

    /// The connector's response exceeded the size cap.
    #[error("connector {tool} response exceeds {limit} bytes")]
    ResponseTooLarge {
        /// The tool being executed.
        tool: String,
        /// The cap that was exceeded.
        limit: usize,
    },

    /// The connector's response was not valid JSON of the expected shape.
    #[error("connector {tool} decode: {source}")]
    Decode {
        /// The tool being executed.
        tool: String,
        /// Underlying decode error.
        source: serde_json::Error,
    },
}

impl ConnectorError {
    /// Whether this error is a deadline expiry (callers record `timeout`
    /// rather than `error`).
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Default)]
struct RegistryInner {
    routes: HashMap<String, String>,
    internal_token: Option<SecretString>,
    timeout: Option<Duration>,
}

/// Thread-safe mapping from tool name to connector base URL.
pub struct ConnectorRegistry {
    http: reqwest::Client,
    inner: RwLock<RegistryInner>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            // Deadlines are applied per request so they can be changed at
            // runtime under the writer lock.
            http: reqwest::Client::new(),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().expect("connector registry lock poisoned")
    }

    /// Maps a tool name to a connector base URL.
    pub fn register(&self, tool: impl Into<String>, base_url: impl Into<String>) {
        self.write().routes.insert(tool.into(), base_url.into());
    }

    /// Configures the service-to-service auth token sent to connectors.
    pub fn set_internal_token(&self, token: SecretString) {
        self.write().internal_token = Some(token);
    }

    /// Overrides the default per-call deadline.
    pub fn set_timeout(&self, timeout: Duration) {
        self.write().timeout = Some(timeout);
    }

    /// Routes the request to its connector and returns the response.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] for unrouted tools, deadline expiry,
    /// transport failures, non-2xx statuses, oversized bodies, and
    /// undecodable responses.
    pub async fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, ConnectorError> {
        // One read-lock acquisition: no partial view across route, token,
        // and timeout updates.
        let (base_url, token, timeout) = {
            let inner = self.inner.read().expect("connector registry lock poisoned");
            let base_url = inner
                .routes
                .get(&req.tool)
                .cloned()
                .ok_or_else(|| ConnectorError::NoRoute { tool: req.tool.clone() })?;
            (base_url, inner.internal_token.clone(), inner.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT))
        };

        let url = format!("{}/exec", base_url.trim_end_matches('/'));
        let mut builder = self.http.post(&url).timeout(timeout).json(req);
        if let Some(token) = &token {
            builder = builder.header(INTERNAL_TOKEN_HEADER, token.expose_secret());
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout { tool: req.tool.clone() }
            } else {
                ConnectorError::Transport { tool: req.tool.clone(), source: e }
            }
        })?;

        let status = resp.status();
        let body = read_capped(resp, MAX_CONNECTOR_RESPONSE_BYTES).await.map_err(|e| match e {
            BodyError::Transport(e) if e.is_timeout() => {
                ConnectorError::Timeout { tool: req.tool.clone() }
            }
            BodyError::Transport(e) => ConnectorError::Transport { tool: req.tool.clone(), source: e },
            BodyError::TooLarge { limit } => {
                ConnectorError::ResponseTooLarge { tool: req.tool.clone(), limit }
            }
        })?;

        if !status.is_success() {
            let snippet =
                String::from_utf8_lossy(&body[..body.len().min(ERROR_SNIPPET_BYTES)]).into_owned();
            return Err(ConnectorError::Status {
                tool: req.tool.clone(),
                status: status.as_u16(),
                snippet,
            });
        }

        serde_json::from_slice(&body)
            .map_err(|e| ConnectorError::Decode { tool: req.tool.clone(), source: e })
    }
}
