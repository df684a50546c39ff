//! Chat Service
//!
//! Realtime chat gateway binary.
//!
//! # Servers
//!
//! - HTTP server for `GET /ws/chat` and the control API (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Initialize tracing (text or JSON per `CHAT_LOG_FORMAT`)
//! 2. Load configuration from environment
//! 3. Initialize Prometheus metrics recorder
//! 4. Build stores and broker (Redis, or in-process for single node)
//! 5. Construct `DeliveryService`, the registry listener and the presence
//!    heartbeat
//! 6. Spawn the broker subscriber (marks the instance ready)
//! 7. Start health server, then the chat server
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chat_service::archive::{HttpArchive, MessageArchive, NoopArchive};
use chat_service::config::{Config, LogFormat, StoreBackend};
use chat_service::delivery::{DeliveryService, DeliverySettings};
use chat_service::fanout::{run_subscriber, Broker, FanoutPublisher, LocalBroker, RedisBroker};
use chat_service::handshake::{AcceptWellFormed, Authenticator};
use chat_service::observability::health::metrics_router;
use chat_service::observability::metrics::init_metrics_recorder;
use chat_service::observability::{health_router, HealthState};
use chat_service::registry::ConnectionRegistry;
use chat_service::routes::{build_routes, AppState};
use chat_service::store::{InMemoryStore, RedisStore, Stores};
use common::jwt::{UserTokenValidator, DEFAULT_CLOCK_SKEW};
use common::secret::ExposeSecret;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for sockets to flush after connections are closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log format is read before the rest of the configuration so that
    // configuration errors are logged in the requested format.
    let log_format = std::env::var("CHAT_LOG_FORMAT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(LogFormat::Text);
    let (text_layer, json_layer) = match log_format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_service=debug,tower_http=debug".into()),
        )
        .with(text_layer)
        .with(json_layer)
        .init();

    info!("Starting Chat Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        store_backend = ?config.store_backend,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        chat_channel = %config.chat_channel,
        notification_channel = %config.notification_channel,
        bearer_auth = config.jwt_secret.is_some(),
        query_identity = config.allow_query_identity,
        archive = config.archive_url.is_some(),
        "Configuration loaded successfully"
    );

    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow!(e)
    })?;

    let health_state = Arc::new(HealthState::new());

    let (stores, broker): (Stores, Arc<dyn Broker>) = match config.store_backend {
        StoreBackend::Redis => {
            let redis_url = config
                .redis_url
                .as_ref()
                .ok_or_else(|| anyhow!("REDIS_URL is required for the redis backend"))?;

            info!("Connecting to Redis...");
            let store = RedisStore::connect(
                redis_url.expose_secret(),
                config.mailbox_capacity,
                config.mailbox_retention,
                config.presence_ttl,
            )
            .await
            .context("Failed to connect Redis store")?;
            let broker = RedisBroker::connect(redis_url.expose_secret())
                .await
                .context("Failed to connect Redis broker")?;
            info!("Redis connection established");

            (Stores::shared(Arc::new(store)), Arc::new(broker))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store and broker: state is not shared between instances");
            let store = InMemoryStore::new(config.mailbox_capacity, config.mailbox_retention)
                .with_presence_ttl(config.presence_ttl);
            (Stores::shared(Arc::new(store)), Arc::new(LocalBroker::new()))
        }
    };

    let archive: Arc<dyn MessageArchive> = match &config.archive_url {
        Some(url) => Arc::new(HttpArchive::new(url.clone())?),
        None => Arc::new(NoopArchive),
    };

    let settings = DeliverySettings::from_config(&config);
    let channels = settings.channels();
    let delivery = Arc::new(DeliveryService::new(
        settings,
        Arc::new(ConnectionRegistry::new(config.write_timeout)),
        stores,
        FanoutPublisher::new(
            Arc::clone(&broker),
            config.publish_timeout,
            config.publish_max_attempts,
        ),
        archive,
    ));

    let shutdown_token = CancellationToken::new();
    let listener_handle = delivery.spawn_registry_listener(shutdown_token.child_token());
    let heartbeat_handle = delivery
        .spawn_presence_heartbeat(config.presence_ttl / 3, shutdown_token.child_token());

    let subscriber_handle = tokio::spawn(run_subscriber(
        broker,
        channels,
        delivery.clone(),
        Arc::clone(&health_state),
        shutdown_token.child_token(),
    ));

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        anyhow!("Invalid health bind address: {e}")
    })?;
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Chat server
    let tokens = config
        .jwt_secret
        .as_ref()
        .map(|secret| UserTokenValidator::new(secret.expose_secret().as_bytes(), DEFAULT_CLOCK_SKEW));
    let state = Arc::new(AppState {
        delivery: Arc::clone(&delivery),
        authenticator: Authenticator::new(
            Arc::new(AcceptWellFormed),
            tokens,
            config.allow_query_identity,
        ),
        connection_buffer: config.connection_buffer,
        shutdown: shutdown_token.child_token(),
    });
    let app = build_routes(state, config.control_api_token.clone());

    let bind_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        anyhow!("Invalid bind address: {e}")
    })?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind chat server to {bind_addr}"))?;

    let server_shutdown_token = shutdown_token.child_token();
    let server_handle = tokio::spawn(async move {
        info!(addr = %bind_addr, "Chat server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("Chat server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Chat server failed");
        }
    });

    info!("Chat Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop routing here
    health_state.set_not_ready();

    shutdown_token.cancel();
    let closed = delivery.close_all();
    info!(connections = closed, "Closed local connections");

    if tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await.is_err() {
        warn!("Chat server did not stop within the grace period");
    }
    let _ = subscriber_handle.await;
    let _ = listener_handle.await;
    let _ = heartbeat_handle.await;

    info!("Chat Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
