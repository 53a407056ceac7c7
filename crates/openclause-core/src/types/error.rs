//! The error taxonomy every service surfaces to callers.
//!
//! Errors are grouped into observable categories with a fixed HTTP status
//! and a retryability flag, so clients can distinguish safely-retryable
//! failures from terminal ones. The JSON body is always
//! `{code, message, retryable, details?}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// A field-level validation failure raised while parsing a request.
#[derive(Debug, Clone, Error)]
#[error("validation: {field} {reason}")]
pub struct ValidationError {
    /// The offending field.
    pub field: &'static str,
    /// Why the field was rejected.
    pub reason: String,
}

impl ValidationError {
    /// A validation error for a field with the given reason.
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }

    /// A "required" validation error for a field.
    #[must_use]
    pub fn required(field: &'static str) -> Self {
        Self::new(field, "required")
    }
}

/// Structured error returned to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed body or malformed identifier.
    #[error("{0}")]
    BadRequest(String),

    /// Bounds or required-field violation.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Missing or invalid API key or internal token.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not permitted, e.g. approver not on allowlist.
    #[error("{0}")]
    Forbidden(String),

    /// Unknown id, or a cross-tenant lookup (existence is never leaked).
    #[error("{0}")]
    NotFound(String),

    /// State precludes the operation, e.g. awaiting approval.
    #[error("{0}")]
    Conflict(String),

    /// Per-tenant token bucket exhausted.
    #[error("too many requests")]
    RateLimited,

    /// Connector deadline exceeded.
    #[error("connector {tool} timed out")]
    ConnectorTimeout {
        /// The tool whose connector timed out.
        tool: String,
    },

    /// Connector returned non-2xx.
    #[error("connector {tool} failed: {detail}")]
    ConnectorError {
        /// The tool whose connector failed.
        tool: String,
        /// Bounded detail from the connector response.
        detail: String,
    },

    /// Storage, policy transport, or marshalling failure.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// The stable error code for the response body.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::ConnectorTimeout { .. } => "CONNECTOR_TIMEOUT",
            Self::ConnectorError { .. } => "CONNECTOR_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The HTTP status this error maps to.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ConnectorTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ConnectorError { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client may safely retry the same request.
    #[must_use]
    pub const fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ConnectorTimeout { .. } | Self::Internal(_)
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
