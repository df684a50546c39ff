//! Chat service error types.
//!
//! `ChatError` covers everything that can go wrong while serving a request
//! or dispatching a message. Nothing here is fatal to the process: failures
//! are isolated to the connection or message that caused them.
//!
//! Over HTTP every error maps to a status code and an
//! `{"error": {"code", "message"}}` body via `IntoResponse`. Internal
//! details are logged server-side and never returned to clients.

use crate::protocol::DecodeError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Chat service error type.
///
/// HTTP mapping:
/// - `Redis`, `Internal`: 500 Internal Server Error
/// - `Broker`, `BrokerUnreachable`, `PublishTimeout`: 503 Service Unavailable
/// - `Decode`, `BadRequest`: 400 Bad Request
/// - `Unauthorized`: 401 Unauthorized
/// - `Archive`, `Config`: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum ChatError {
    /// Shared store operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Broker publish or subscribe failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The broker refused the connection; the command was never sent.
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// Broker publish did not complete within the publish timeout.
    #[error("Broker publish timed out")]
    PublishTimeout,

    /// Persistence collaborator call failed.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Envelope failed to decode or validate.
    #[error("Invalid message: {0}")]
    Decode(#[from] DecodeError),

    /// Control API request was malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Control API caller was not authenticated.
    #[error("Unauthorized")]
    Unauthorized,

    /// Internal error.
    #[error("Internal error")]
    Internal,
}

impl ChatError {
    /// Stable error code used in HTTP bodies and Error frames.
    pub fn error_code(&self) -> &'static str {
        match self {
            ChatError::Redis(_) | ChatError::Archive(_) | ChatError::Config(_) | ChatError::Internal => {
                "INTERNAL_ERROR"
            }
            ChatError::Broker(_)
            | ChatError::BrokerUnreachable(_)
            | ChatError::PublishTimeout => "SERVICE_UNAVAILABLE",
            ChatError::Decode(_) => "INVALID_MESSAGE",
            ChatError::BadRequest(_) => "BAD_REQUEST",
            ChatError::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Redis(_) | ChatError::Archive(_) | ChatError::Config(_) | ChatError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ChatError::Broker(_)
            | ChatError::BrokerUnreachable(_)
            | ChatError::PublishTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Decode(_) | ChatError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Redis(_) | ChatError::Archive(_) | ChatError::Config(_) | ChatError::Internal => {
                "An internal error occurred".to_string()
            }
            ChatError::Broker(_)
            | ChatError::BrokerUnreachable(_)
            | ChatError::PublishTimeout => {
                "Message delivery is temporarily unavailable".to_string()
            }
            ChatError::Decode(e) => e.to_string(),
            ChatError::BadRequest(msg) => msg.clone(),
            ChatError::Unauthorized => "Missing or invalid service token".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(target: "chat.api", error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) = "Bearer realm=\"chat-control-api\"".parse() {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use http_body_util::BodyExt;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ChatError::Redis("down".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ChatError::PublishTimeout.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ChatError::Decode(DecodeError::ConflictingTarget).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ChatError::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let redis_err = ChatError::Redis("connection refused at 10.0.0.7:6379".to_string());
        assert!(!redis_err.client_message().contains("10.0.0.7"));
        assert_eq!(redis_err.client_message(), "An internal error occurred");

        let broker_err = ChatError::Broker("NOAUTH Authentication required".to_string());
        assert!(!broker_err.client_message().contains("NOAUTH"));

        let refused = ChatError::BrokerUnreachable("Connection refused (os error 111)".to_string());
        assert!(!refused.client_message().contains("os error"));
        assert_eq!(refused.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_decode_error_message_is_passed_through() {
        let err: ChatError = DecodeError::MissingTarget(MessageKind::Chat).into();
        assert_eq!(err.error_code(), "INVALID_MESSAGE");
        assert_eq!(err.client_message(), "CHAT messages require a target");
    }

    #[tokio::test]
    async fn test_into_response_body_shape() {
        let response = ChatError::BadRequest("receiverId is required".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
        assert_eq!(json["error"]["message"], "receiverId is required");
    }

    #[test]
    fn test_unauthorized_has_www_authenticate() {
        let response = ChatError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("WWW-Authenticate"));
    }
}
