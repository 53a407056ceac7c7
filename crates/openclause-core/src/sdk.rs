//! Client SDK for agents integrating against the gateway.
//!
//! Wraps submit and execute-resume, fills in idempotency and trace ids
//! when the caller does not care, and exposes a polling helper that waits
//! out the approval window.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::httpbody::{read_capped, BodyError};
use crate::types::{ToolCallRequest, ToolCallResponse};

/// Client-side response body cap.
const MAX_RESPONSE_BYTES: usize = 4 << 20;

/// Per-call deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors returned by the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// The request could not be sent or the response not read.
    #[error("gateway request: {0}")]
    Transport(#[from] reqwest::Error),

    /// The gateway answered with a structured API error.
    #[error("[{code}] {message}")]
    Api {
        /// Stable error code from the taxonomy.
        code: String,
        /// Human-readable message.
        message: String,
        /// Whether the gateway marked the failure retryable.
        retryable: bool,
        /// HTTP status of the response.
        status: u16,
    },

    /// The gateway answered with a non-2xx status and no parsable body.
    #[error("gateway returned http status {0}")]
    Status(u16),

    /// The response body exceeded the size cap.
    #[error("gateway response exceeds {limit} bytes")]
    ResponseTooLarge {
        /// The cap that was exceeded.
        limit: usize,
    },

    /// The response was not valid JSON of the expected shape.
    #[error("gateway decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SdkError {
    /// Whether retrying the same call may succeed. Conflicts count: an
    /// execute that is "awaiting approval" resolves once a human acts.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { retryable, status, .. } => *retryable || *status == 409,
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<BodyError> for SdkError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::Transport(e) => Self::Transport(e),
            BodyError::TooLarge { limit } => Self::ResponseTooLarge { limit },
        }
    }
}

#[derive(Deserialize)]
struct WireApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retryable: bool,
}

/// A gateway client bound to one tenant API key.
pub struct Client {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl Client {
    /// Creates a client for the gateway at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, SdkError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base_url: String = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    /// Submits a tool-call request.
    ///
    /// An empty `idempotency_key` is replaced with a fresh one — callers
    /// wanting retry-safe dedup must set it themselves. An empty
    /// `trace_id` is also filled in.
    ///
    /// # Errors
    ///
    /// Returns an [`SdkError`] on transport failure or a non-2xx answer.
    pub async fn submit(&self, mut req: ToolCallRequest) -> Result<ToolCallResponse, SdkError> {
        if req.idempotency_key.is_empty() {
            req.idempotency_key = Uuid::new_v4().to_string();
        }
        if req.trace_id.is_empty() {
            req.trace_id = Uuid::new_v4().to_string();
        }
        let resp = self
            .http
            .post(format!("{}/v1/toolcalls", self.base_url))
            .header("X-API-Key", &self.api_key)
            .json(&req)
            .send()
            .await?;
        decode(resp).await
    }

    /// Resumes an approved request by parent event id.
    ///
    /// # Errors
    ///
    /// Returns an [`SdkError`]; "awaiting approval" surfaces as a
    /// retryable 409 API error.
    pub async fn execute(&self, parent_event_id: &str) -> Result<ToolCallResponse, SdkError> {
        let resp = self
            .http
            .post(format!("{}/v1/toolcalls/{parent_event_id}/execute", self.base_url))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        decode(resp).await
    }

    /// Polls execute until the approval is granted (or a terminal error
    /// occurs). Runs until cancelled by dropping the future or by
    /// wrapping it in a timeout.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable [`SdkError`].
    pub async fn wait_for_approval_then_execute(
        &self,
        parent_event_id: &str,
        poll_every: Duration,
    ) -> Result<ToolCallResponse, SdkError> {
        let mut ticker = tokio::time::interval(poll_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.execute(parent_event_id).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

async fn decode(resp: reqwest::Response) -> Result<ToolCallResponse, SdkError> {
    let status = resp.status();
    let body = read_capped(resp, MAX_RESPONSE_BYTES).await?;
    if !status.is_success() {
        if let Ok(api_err) = serde_json::from_slice::<WireApiError>(&body) {
            if !api_err.message.is_empty() {
                return Err(SdkError::Api {
                    code: api_err.code,
                    message: api_err.message,
                    retryable: api_err.retryable,
                    status: status.as_u16(),
                });
            }
        }
        return Err(SdkError::Status(status.as_u16()));
    }
    Ok(serde_json::from_slice(&body)?)
}
