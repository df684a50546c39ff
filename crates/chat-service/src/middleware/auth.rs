//! Service-token authentication for the control API.
//!
//! Callers send `Authorization: Bearer <token>`. The token is compared
//! against the configured control token in constant time. When no token is
//! configured every control call is rejected.

use crate::errors::ChatError;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::IntoResponse,
};
use common::secret::{ExposeSecret, SecretString};
use ring::constant_time;
use std::sync::Arc;
use tracing::instrument;

/// State for the service-token middleware.
#[derive(Clone)]
pub struct ServiceAuthState {
    /// Expected token. `None` rejects everything.
    pub token: Option<SecretString>,
}

fn extract_bearer_token(req: &Request) -> Result<&str, ChatError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::debug!(target: "chat.middleware.auth", "Missing Authorization header");
            ChatError::Unauthorized
        })?;

    auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        tracing::debug!(target: "chat.middleware.auth", "Invalid Authorization header format");
        ChatError::Unauthorized
    })
}

/// Reject control calls without the configured service token.
///
/// # Response
///
/// - 401 Unauthorized with `WWW-Authenticate` if the token is missing,
///   wrong, or no token is configured
/// - Otherwise continues to the handler
#[instrument(skip_all, name = "chat.middleware.service_auth")]
pub async fn require_service_token(
    State(state): State<Arc<ServiceAuthState>>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, ChatError> {
    let Some(expected) = &state.token else {
        tracing::warn!(target: "chat.middleware.auth", "Control API token not configured");
        return Err(ChatError::Unauthorized);
    };

    let token = extract_bearer_token(&req)?;
    if constant_time::verify_slices_are_equal(token.as_bytes(), expected.expose_secret().as_bytes())
        .is_err()
    {
        tracing::debug!(target: "chat.middleware.auth", "Service token mismatch");
        return Err(ChatError::Unauthorized);
    }

    Ok(next.run(req).await)
}
