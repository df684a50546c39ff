//! Test server harness for E2E testing.
//!
//! Provides `TestChatServer` for spawning a real chat server in tests.

use crate::fixtures::{test_settings, TEST_JWT_SECRET, TEST_SERVICE_TOKEN};
use chat_service::archive::NoopArchive;
use chat_service::delivery::DeliveryService;
use chat_service::fanout::{run_subscriber, Broker, FanoutPublisher, InboundHandler, LocalBroker};
use chat_service::handshake::{AcceptWellFormed, Authenticator};
use chat_service::observability::HealthState;
use chat_service::registry::ConnectionRegistry;
use chat_service::routes::{build_routes, AppState};
use chat_service::store::{InMemoryStore, Stores};
use common::jwt::{UserTokenValidator, DEFAULT_CLOCK_SKEW};
use common::secret::SecretString;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning the chat server in E2E tests.
///
/// The server runs the in-memory backend, accepts both bearer tokens signed
/// with [`TEST_JWT_SECRET`] and `?userId=` identities, and protects the
/// control API with [`TEST_SERVICE_TOKEN`].
///
/// # Example
/// ```rust,ignore
/// let server = TestChatServer::spawn().await?;
/// let (socket, _) = tokio_tungstenite::connect_async(server.ws_url("alice")).await?;
/// ```
pub struct TestChatServer {
    addr: SocketAddr,
    delivery: Arc<DeliveryService>,
    shutdown: CancellationToken,
    _server: JoinHandle<()>,
    _subscriber: JoinHandle<()>,
    _listener: JoinHandle<()>,
}

impl TestChatServer {
    /// Bind 127.0.0.1:0, start serving and wait for the broker subscription.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        let broker: Arc<dyn Broker> = Arc::new(LocalBroker::new());
        let store = Arc::new(InMemoryStore::new(100, Duration::from_secs(3600)));
        let settings = test_settings("chat-e2e");
        let channels = settings.channels();

        let delivery = Arc::new(DeliveryService::new(
            settings,
            Arc::new(ConnectionRegistry::new(Duration::from_secs(1))),
            Stores::shared(store),
            FanoutPublisher::new(Arc::clone(&broker), Duration::from_secs(1), 1),
            Arc::new(NoopArchive),
        ));

        let shutdown = CancellationToken::new();
        let health = Arc::new(HealthState::new());
        let subscriber = tokio::spawn(run_subscriber(
            broker,
            channels,
            Arc::clone(&delivery) as Arc<dyn InboundHandler>,
            Arc::clone(&health),
            shutdown.child_token(),
        ));

        let listener_task = delivery.spawn_registry_listener(shutdown.child_token());

        let state = Arc::new(AppState {
            delivery: Arc::clone(&delivery),
            authenticator: Authenticator::new(
                Arc::new(AcceptWellFormed),
                Some(UserTokenValidator::new(
                    TEST_JWT_SECRET.as_bytes(),
                    DEFAULT_CLOCK_SKEW,
                )),
                true,
            ),
            connection_buffer: 64,
            shutdown: shutdown.child_token(),
        });
        let app = build_routes(state, Some(SecretString::from(TEST_SERVICE_TOKEN.to_string())));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let server_token = shutdown.child_token();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_token.cancelled().await })
                .await;
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !health.is_ready() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("Test server subscriber did not become ready"))?;

        Ok(Self {
            addr,
            delivery,
            shutdown,
            _server: server,
            _subscriber: subscriber,
            _listener: listener_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL for HTTP requests, e.g. `http://127.0.0.1:12345`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket URL identifying as `user_id` through the query string.
    pub fn ws_url(&self, user_id: &str) -> String {
        format!("ws://{}/ws/chat?userId={}", self.addr, user_id)
    }

    /// WebSocket URL with no identity.
    pub fn anonymous_ws_url(&self) -> String {
        format!("ws://{}/ws/chat", self.addr)
    }

    pub fn delivery(&self) -> &Arc<DeliveryService> {
        &self.delivery
    }
}

impl Drop for TestChatServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
