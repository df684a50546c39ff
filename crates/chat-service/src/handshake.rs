//! WebSocket handshake authentication.
//!
//! Runs once per upgrade request, before any socket exists. The identity it
//! returns is bound to the connection for its whole lifetime.
//!
//! # Identity sources
//!
//! 1. `Authorization: Bearer <jwt>`: HS256 user token, `sub` is the user id.
//!    Only accepted when a token secret is configured.
//! 2. `?userId=<id>`: only when query identity is enabled.
//!
//! A bearer header wins over the query parameter. A bearer token that fails
//! validation is rejected outright; it never falls back to the query.

use crate::errors::ChatError;
use crate::observability::metrics;
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use common::jwt::UserTokenValidator;
use common::types::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Query parameter carrying the user id.
pub const USER_ID_QUERY_PARAM: &str = "userId";

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("No user identity supplied")]
    MissingIdentity,

    #[error("User identity is not valid")]
    InvalidIdentity,
}

impl RejectReason {
    /// Metrics label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::MissingIdentity => "missing_identity",
            RejectReason::InvalidIdentity => "invalid_identity",
        }
    }
}

/// The parts of an upgrade request the authenticator looks at.
#[derive(Debug, Clone, Default)]
pub struct HandshakeContext {
    pub query_user_id: Option<String>,
    pub authorization: Option<String>,
}

impl HandshakeContext {
    /// Extract the identity sources from query parameters and headers.
    #[must_use]
    pub fn from_request(query: &HashMap<String, String>, headers: &HeaderMap) -> Self {
        Self {
            query_user_id: query.get(USER_ID_QUERY_PARAM).cloned(),
            authorization: headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        }
    }

    fn bearer_token(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    fn query_identity(&self) -> Option<&str> {
        self.query_user_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Directory lookup deciding whether a syntactically valid user id is
/// allowed to connect.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn is_valid(&self, user: &UserId) -> Result<bool, ChatError>;
}

/// Accepts every well-formed user id.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptWellFormed;

#[async_trait]
impl IdentityValidator for AcceptWellFormed {
    async fn is_valid(&self, _user: &UserId) -> Result<bool, ChatError> {
        Ok(true)
    }
}

/// Gate in front of the WebSocket upgrade.
#[derive(Clone)]
pub struct Authenticator {
    identities: Arc<dyn IdentityValidator>,
    tokens: Option<Arc<UserTokenValidator>>,
    allow_query_identity: bool,
}

impl Authenticator {
    #[must_use]
    pub fn new(
        identities: Arc<dyn IdentityValidator>,
        tokens: Option<UserTokenValidator>,
        allow_query_identity: bool,
    ) -> Self {
        Self {
            identities,
            tokens: tokens.map(Arc::new),
            allow_query_identity,
        }
    }

    /// Resolve the identity for an upgrade request.
    ///
    /// # Errors
    ///
    /// - `MissingIdentity` if no usable identity source is present.
    /// - `InvalidIdentity` if the token or user id fails validation, or the
    ///   identity validator refuses it.
    #[instrument(skip_all, name = "chat.handshake.authenticate")]
    pub async fn authenticate(&self, context: &HandshakeContext) -> Result<UserId, RejectReason> {
        let result = self.resolve(context).await;
        match &result {
            Ok(user) => info!(target: "chat.handshake", user_id = %user, "Handshake accepted"),
            Err(reason) => {
                metrics::record_handshake_rejected(reason.as_str());
                warn!(target: "chat.handshake", reason = reason.as_str(), "Handshake rejected");
            }
        }
        result
    }

    async fn resolve(&self, context: &HandshakeContext) -> Result<UserId, RejectReason> {
        let user = if let Some(token) = context.bearer_token() {
            self.user_from_token(token)?
        } else if self.allow_query_identity {
            let raw = context
                .query_identity()
                .ok_or(RejectReason::MissingIdentity)?;
            UserId::parse(raw).map_err(|e| {
                debug!(target: "chat.handshake", error = %e, "Malformed query identity");
                RejectReason::InvalidIdentity
            })?
        } else {
            return Err(RejectReason::MissingIdentity);
        };

        match self.identities.is_valid(&user).await {
            Ok(true) => Ok(user),
            Ok(false) => Err(RejectReason::InvalidIdentity),
            Err(e) => {
                warn!(target: "chat.handshake", error = %e, "Identity lookup failed");
                Err(RejectReason::InvalidIdentity)
            }
        }
    }

    fn user_from_token(&self, token: &str) -> Result<UserId, RejectReason> {
        let Some(tokens) = &self.tokens else {
            debug!(target: "chat.handshake", "Bearer token supplied but token auth is disabled");
            return Err(RejectReason::InvalidIdentity);
        };
        tokens
            .validate(token)
            .and_then(|claims| claims.user_id())
            .map_err(|e| {
                debug!(target: "chat.handshake", error = %e, "Bearer token rejected");
                RejectReason::InvalidIdentity
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use common::jwt::{issue_user_token, UserClaims, DEFAULT_CLOCK_SKEW};
    use std::time::Duration;

    const SECRET: &[u8] = b"handshake-test-secret-0123456789";

    struct DenyList(Vec<&'static str>);

    #[async_trait]
    impl IdentityValidator for DenyList {
        async fn is_valid(&self, user: &UserId) -> Result<bool, ChatError> {
            Ok(!self.0.contains(&user.as_str()))
        }
    }

    fn authenticator(allow_query: bool) -> Authenticator {
        Authenticator::new(
            Arc::new(DenyList(vec!["banned"])),
            Some(UserTokenValidator::new(SECRET, DEFAULT_CLOCK_SKEW)),
            allow_query,
        )
    }

    fn query(user: &str) -> HandshakeContext {
        HandshakeContext {
            query_user_id: Some(user.to_string()),
            authorization: None,
        }
    }

    fn bearer(token: &str) -> HandshakeContext {
        HandshakeContext {
            query_user_id: None,
            authorization: Some(format!("Bearer {token}")),
        }
    }

    #[tokio::test]
    async fn test_query_identity_accepted() {
        let user = authenticator(true).authenticate(&query("alice")).await.unwrap();
        assert_eq!(user.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_missing_identity() {
        let result = authenticator(true)
            .authenticate(&HandshakeContext::default())
            .await;
        assert_eq!(result, Err(RejectReason::MissingIdentity));

        let result = authenticator(true).authenticate(&query("   ")).await;
        assert_eq!(result, Err(RejectReason::MissingIdentity));
    }

    #[tokio::test]
    async fn test_query_identity_disabled() {
        let result = authenticator(false).authenticate(&query("alice")).await;
        assert_eq!(result, Err(RejectReason::MissingIdentity));
    }

    #[tokio::test]
    async fn test_malformed_or_refused_identity() {
        let auth = authenticator(true);
        assert_eq!(
            auth.authenticate(&query("not valid!")).await,
            Err(RejectReason::InvalidIdentity)
        );
        assert_eq!(
            auth.authenticate(&query("banned")).await,
            Err(RejectReason::InvalidIdentity)
        );
    }

    #[tokio::test]
    async fn test_bearer_token_wins_over_query() {
        let token = issue_user_token(
            SECRET,
            &UserClaims::for_user("carol", Duration::from_secs(60)),
        )
        .unwrap();
        let context = HandshakeContext {
            query_user_id: Some("mallory".to_string()),
            authorization: Some(format!("Bearer {token}")),
        };

        let user = authenticator(true).authenticate(&context).await.unwrap();
        assert_eq!(user.as_str(), "carol");
    }

    #[tokio::test]
    async fn test_bad_bearer_token_does_not_fall_back() {
        let mut context = bearer("not-a-jwt");
        context.query_user_id = Some("alice".to_string());

        let result = authenticator(true).authenticate(&context).await;
        assert_eq!(result, Err(RejectReason::InvalidIdentity));
    }

    #[tokio::test]
    async fn test_bearer_without_token_secret_is_invalid() {
        let auth = Authenticator::new(Arc::new(AcceptWellFormed), None, true);
        let result = auth.authenticate(&bearer("anything")).await;
        assert_eq!(result, Err(RejectReason::InvalidIdentity));
    }

    #[test]
    fn test_context_from_request() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        let query = HashMap::from([(USER_ID_QUERY_PARAM.to_string(), "dave".to_string())]);

        let context = HandshakeContext::from_request(&query, &headers);
        assert_eq!(context.query_user_id.as_deref(), Some("dave"));
        assert_eq!(context.bearer_token(), Some("abc"));
    }
}
