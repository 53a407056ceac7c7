//! Authentication middleware shared by the services.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use secrecy::SecretString;

use openclause_core::auth::{verify_internal_token, ApiKeyStore};
use openclause_core::types::ApiError;

/// Header carrying a tenant API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Header carrying the service-to-service token.
pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

/// The authenticated tenant, inserted into request extensions by
/// [`api_key_auth`].
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

/// State for the API-key middleware.
#[derive(Clone)]
pub struct ApiKeyAuthState {
    /// Hashed key → tenant lookup table.
    pub keys: Arc<ApiKeyStore>,
}

/// Validates the tenant API key (`X-API-Key` or `Authorization: Bearer`)
/// and stores the authenticated [`TenantId`] in request extensions.
pub async fn api_key_auth(
    State(state): State<ApiKeyAuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    let Some(api_key) = api_key else {
        return ApiError::Unauthorized("missing API key".to_string()).into_response();
    };
    let Some(tenant_id) = state.keys.lookup(&api_key) else {
        return ApiError::Unauthorized("invalid API key".to_string()).into_response();
    };

    request.extensions_mut().insert(TenantId(tenant_id.to_string()));
    next.run(request).await
}

/// State for the internal-token middleware.
#[derive(Clone)]
pub struct InternalAuthState {
    /// The configured token; `None` disables the check.
    pub token: Option<SecretString>,
}

/// Validates the `X-Internal-Token` header in constant time.
pub async fn internal_token_auth(
    State(state): State<InternalAuthState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if !verify_internal_token(state.token.as_ref(), presented) {
        return ApiError::Unauthorized("missing or invalid internal token".to_string())
            .into_response();
    }
    next.run(request).await
}
