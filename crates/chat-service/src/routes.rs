//! HTTP routes for the chat service.
//!
//! Defines the Axum router and application state.

use crate::delivery::DeliveryService;
use crate::handlers;
use crate::handshake::Authenticator;
use crate::middleware::{log_execution_time, require_service_token, ServiceAuthState};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use common::secret::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout for control API calls.
const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub delivery: Arc<DeliveryService>,

    /// Gate for WebSocket upgrades.
    pub authenticator: Authenticator,

    /// Outbound queue depth per connection.
    pub connection_buffer: usize,

    /// Parent of every connection's cancellation token.
    pub shutdown: CancellationToken,
}

/// Build the application routes.
///
/// - `GET /ws/chat` - WebSocket upgrade (handshake-authenticated)
/// - `/api/v1/...` - control API (service-token protected)
/// - TraceLayer for request logging
/// - execution-time logging and HTTP metrics
/// - 30 second timeout on control API requests
pub fn build_routes(state: Arc<AppState>, control_api_token: Option<SecretString>) -> Router {
    let auth_state = Arc::new(ServiceAuthState {
        token: control_api_token,
    });

    let ws_routes = Router::new()
        .route("/ws/chat", get(handlers::ws::ws_upgrade))
        .with_state(Arc::clone(&state));

    let control_routes = Router::new()
        .route(
            "/api/v1/messages/private",
            post(handlers::control::send_private_message),
        )
        .route(
            "/api/v1/messages/room",
            post(handlers::control::send_room_message),
        )
        .route(
            "/api/v1/notifications",
            post(handlers::control::send_notification),
        )
        .route(
            "/api/v1/presence/online-count",
            get(handlers::control::online_count),
        )
        .route(
            "/api/v1/presence/users/:user_id",
            get(handlers::control::user_presence),
        )
        .route(
            "/api/v1/rooms/:room_id/participants/count",
            get(handlers::control::participant_count),
        )
        .route(
            "/api/v1/users/:user_id/mailbox",
            get(handlers::control::take_mailbox),
        )
        .route(
            "/api/v1/users/:user_id/rooms",
            delete(handlers::control::remove_user_rooms),
        )
        .route_layer(middleware::from_fn_with_state(
            auth_state,
            require_service_token,
        ))
        .layer(TimeoutLayer::new(CONTROL_REQUEST_TIMEOUT))
        .with_state(state);

    // Layer order (bottom-to-top execution):
    // 1. TraceLayer - Log request details
    // 2. log_execution_time - Record ALL responses (outermost)
    ws_routes
        .merge(control_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(log_execution_time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
