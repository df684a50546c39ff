//! Bearer-token utilities for user identity.
//!
//! Clients may authenticate the chat handshake with
//! `Authorization: Bearer <jwt>`. Tokens are HS256-signed by the identity
//! service with a shared secret; the `sub` claim carries the user identity.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Only HS256 is accepted
//! - Error messages are generic; details are logged at debug level
//! - The `sub` field in `UserClaims` is redacted in Debug output

use crate::types::UserId;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey};
use jsonwebtoken::{Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Oversized tokens are rejected before any base64 decoding or signature
/// verification.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default JWT clock skew tolerance (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during bearer-token validation.
///
/// Every variant renders the same client-facing message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token is not a well-formed JWT.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Signature did not verify.
    #[error("The access token is invalid or expired")]
    InvalidSignature,

    /// Token `exp` is in the past.
    #[error("The access token is invalid or expired")]
    Expired,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,

    /// The `sub` claim is not a valid user identity.
    #[error("The access token is invalid or expired")]
    InvalidSubject,
}

// =============================================================================
// Claims Types
// =============================================================================

/// User token claims.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// Subject (user identity) - redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,

    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("name", &self.name)
            .finish()
    }
}

impl UserClaims {
    /// Claims for `sub` valid for `ttl` from now.
    #[must_use]
    pub fn for_user(sub: impl Into<String>, ttl: Duration) -> Self {
        let now = chrono::Utc::now().timestamp();
        #[allow(clippy::cast_possible_wrap)]
        let ttl_secs = ttl.as_secs() as i64;
        Self {
            sub: sub.into(),
            exp: now + ttl_secs,
            iat: now,
            name: None,
        }
    }

    /// Parse the `sub` claim as a user identity.
    ///
    /// # Errors
    ///
    /// Returns `JwtValidationError::InvalidSubject` if `sub` is not a valid
    /// `UserId`.
    pub fn user_id(&self) -> Result<UserId, JwtValidationError> {
        UserId::parse(self.sub.clone()).map_err(|e| {
            tracing::debug!(target: "common.jwt", error = %e, "Token subject is not a valid user id");
            JwtValidationError::InvalidSubject
        })
    }
}

// =============================================================================
// Validation
// =============================================================================

/// HS256 validator for user bearer tokens.
#[derive(Clone)]
pub struct UserTokenValidator {
    key: DecodingKey,
    validation: Validation,
    clock_skew: Duration,
}

impl fmt::Debug for UserTokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserTokenValidator")
            .field("key", &"[REDACTED]")
            .field("clock_skew", &self.clock_skew)
            .finish()
    }
}

impl UserTokenValidator {
    /// Create a validator for tokens signed with `secret`.
    ///
    /// `clock_skew` is clamped to [`MAX_CLOCK_SKEW`].
    #[must_use]
    pub fn new(secret: &[u8], clock_skew: Duration) -> Self {
        let clock_skew = clock_skew.min(MAX_CLOCK_SKEW);
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = clock_skew.as_secs();
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            clock_skew,
        }
    }

    /// Verify signature, expiry and `iat` and return the claims.
    ///
    /// # Errors
    ///
    /// Returns a `JwtValidationError` variant describing why the token was
    /// rejected.
    pub fn validate(&self, token: &str) -> Result<UserClaims, JwtValidationError> {
        if token.len() > MAX_JWT_SIZE_BYTES {
            tracing::debug!(
                target: "common.jwt",
                token_size = token.len(),
                max_size = MAX_JWT_SIZE_BYTES,
                "Token rejected: size exceeds maximum allowed"
            );
            return Err(JwtValidationError::TokenTooLarge);
        }

        let data = decode::<UserClaims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(target: "common.jwt", error = %e, "Token rejected");
            match e.kind() {
                ErrorKind::ExpiredSignature => JwtValidationError::Expired,
                ErrorKind::InvalidSignature => JwtValidationError::InvalidSignature,
                _ => JwtValidationError::MalformedToken,
            }
        })?;

        validate_iat(data.claims.iat, self.clock_skew)?;
        Ok(data.claims)
    }
}

/// Sign `claims` with `secret` (HS256).
///
/// Used by tooling and tests that need to mint user tokens.
///
/// # Errors
///
/// Returns `JwtValidationError::MalformedToken` if encoding fails.
pub fn issue_user_token(secret: &[u8], claims: &UserClaims) -> Result<String, JwtValidationError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to encode token");
        JwtValidationError::MalformedToken
    })
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if the iat timestamp is more than
/// `clock_skew` in the future.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // clock_skew is bounded to MAX_CLOCK_SKEW (600 seconds)
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-that-is-long-enough-for-hs256";

    #[test]
    fn test_issue_and_validate_round_trip() {
        let claims = UserClaims::for_user("alice", Duration::from_secs(60));
        let token = issue_user_token(SECRET, &claims).unwrap();

        let validator = UserTokenValidator::new(SECRET, DEFAULT_CLOCK_SKEW);
        let validated = validator.validate(&token).unwrap();

        assert_eq!(validated.sub, "alice");
        assert_eq!(validated.user_id().unwrap().as_str(), "alice");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let claims = UserClaims::for_user("alice", Duration::from_secs(60));
        let token = issue_user_token(SECRET, &claims).unwrap();

        let validator = UserTokenValidator::new(b"some-other-secret-value", DEFAULT_CLOCK_SKEW);
        assert_eq!(
            validator.validate(&token).unwrap_err(),
            JwtValidationError::InvalidSignature
        );
    }

    #[test]
    fn test_expired_token_rejected() {
        let now = chrono::Utc::now().timestamp();
        let claims = UserClaims {
            sub: "alice".to_string(),
            exp: now - 3600,
            iat: now - 7200,
            name: None,
        };
        let token = issue_user_token(SECRET, &claims).unwrap();

        let validator = UserTokenValidator::new(SECRET, Duration::from_secs(5));
        assert_eq!(
            validator.validate(&token).unwrap_err(),
            JwtValidationError::Expired
        );
    }

    #[test]
    fn test_oversized_token_rejected_before_parsing() {
        let validator = UserTokenValidator::new(SECRET, DEFAULT_CLOCK_SKEW);
        let token = "a".repeat(MAX_JWT_SIZE_BYTES + 1);
        assert_eq!(
            validator.validate(&token).unwrap_err(),
            JwtValidationError::TokenTooLarge
        );
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        let validator = UserTokenValidator::new(SECRET, DEFAULT_CLOCK_SKEW);
        assert_eq!(
            validator.validate("not-a-jwt").unwrap_err(),
            JwtValidationError::MalformedToken
        );
    }

    #[test]
    fn test_invalid_subject() {
        let claims = UserClaims::for_user("not a user!", Duration::from_secs(60));
        assert_eq!(
            claims.user_id().unwrap_err(),
            JwtValidationError::InvalidSubject
        );
    }

    #[test]
    fn test_validate_iat_boundaries() {
        let now = 1_700_000_000;
        let skew = Duration::from_secs(300);

        assert!(validate_iat_at(now, skew, now).is_ok());
        assert!(validate_iat_at(now + 300, skew, now).is_ok());
        assert_eq!(
            validate_iat_at(now + 301, skew, now),
            Err(JwtValidationError::IatTooFarInFuture)
        );
    }

    #[test]
    fn test_claims_debug_redacts_subject() {
        let claims = UserClaims::for_user("secret-user", Duration::from_secs(60));
        let debug = format!("{claims:?}");
        assert!(!debug.contains("secret-user"));
        assert!(debug.contains("[REDACTED]"));
    }
}
