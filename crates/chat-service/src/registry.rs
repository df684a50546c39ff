//! Connection registry.
//!
//! Maps a user identity to the one live connection that user has on this
//! instance. The registry only knows about local connections; cluster-wide
//! presence lives in the [`PresenceStore`](crate::store::PresenceStore).
//!
//! # Connection handles
//!
//! A [`Connection`] is the writable half of a WebSocket: a bounded queue of
//! encoded frames drained by the socket's writer task, plus a
//! `CancellationToken` that tears the socket down. Handles are shared as
//! `Arc<Connection>` between the registry and the socket tasks.
//!
//! # Concurrency
//!
//! Entries live in a `DashMap`. Map guards are never held across an await:
//! every operation clones the `Arc<Connection>` out first.
//!
//! # Failure
//!
//! A send that times out or finds the writer gone evicts the connection and
//! emits a [`RegistryEvent`] with [`UnregisterReason::TransportFailure`] so
//! presence and room observers can react as if the user disconnected.

use crate::observability::metrics;
use crate::protocol::Envelope;
use chrono::Utc;
use common::types::{ConnectionId, UserId};
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the registry event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Outcome of a local send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Frame queued on the user's live connection.
    Delivered,
    /// No live connection for the user on this instance.
    NotLocal,
    /// The connection failed or timed out and was evicted.
    TransportError,
}

impl DeliveryResult {
    /// Metrics label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryResult::Delivered => "delivered",
            DeliveryResult::NotLocal => "not_local",
            DeliveryResult::TransportError => "transport_error",
        }
    }
}

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterReason {
    /// The socket closed normally.
    Closed,
    /// A send failed or timed out.
    TransportFailure,
    /// A newer connection for the same user took its place.
    Replaced,
}

/// Registry change notification.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered {
        user: UserId,
        connection_id: ConnectionId,
    },
    Unregistered {
        user: UserId,
        connection_id: ConnectionId,
        reason: UnregisterReason,
    },
}

/// Writable handle to one live client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user: UserId,
    sender: mpsc::Sender<Arc<str>>,
    cancel_token: CancellationToken,
    /// Unix millis of the last inbound or outbound frame.
    last_activity: AtomicI64,
}

impl Connection {
    /// Create a connection handle and the receiver its writer task drains.
    #[must_use]
    pub fn new(
        user: UserId,
        buffer: usize,
        cancel_token: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            user,
            sender,
            cancel_token,
            last_activity: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        (connection, receiver)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Open until cancelled or the writer task has gone away.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.cancel_token.is_cancelled() && !self.sender.is_closed()
    }

    /// Cancel the connection's socket tasks.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    /// Token the socket tasks select on.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Unix millis of the last recorded activity.
    #[must_use]
    pub fn last_activity_millis(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    async fn send_frame(&self, frame: Arc<str>, write_timeout: Duration) -> bool {
        match tokio::time::timeout(write_timeout, self.sender.send(frame)).await {
            Ok(Ok(())) => {
                self.touch();
                true
            }
            Ok(Err(_)) => {
                debug!(
                    target: "chat.registry",
                    user_id = %self.user,
                    connection_id = %self.id,
                    "Writer task gone"
                );
                false
            }
            Err(_) => {
                warn!(
                    target: "chat.registry",
                    user_id = %self.user,
                    connection_id = %self.id,
                    timeout_ms = write_timeout.as_millis(),
                    "Write timed out"
                );
                false
            }
        }
    }
}

/// Local user -> connection map.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Arc<Connection>>,
    write_timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(write_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: DashMap::new(),
            write_timeout,
            events,
        }
    }

    /// Subscribe to registration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register `connection` for its user, closing any connection it
    /// replaces. Returns the replaced connection.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let user = connection.user().clone();
        let connection_id = connection.id();
        let previous = self.connections.insert(user.clone(), connection);

        if let Some(old) = &previous {
            old.close();
            info!(
                target: "chat.registry",
                user_id = %user,
                old_connection_id = %old.id(),
                new_connection_id = %connection_id,
                "Replaced existing connection"
            );
            self.emit(RegistryEvent::Unregistered {
                user: user.clone(),
                connection_id: old.id(),
                reason: UnregisterReason::Replaced,
            });
        } else {
            debug!(
                target: "chat.registry",
                user_id = %user,
                connection_id = %connection_id,
                "Registered connection"
            );
        }

        self.emit(RegistryEvent::Registered {
            user,
            connection_id,
        });
        metrics::set_connections_active(self.connections.len());
        previous
    }

    /// Remove and close whatever connection `user` has.
    pub fn unregister(&self, user: &UserId) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(user)?;
        self.finish_removal(&connection, UnregisterReason::Closed);
        Some(connection)
    }

    /// Remove `user`'s entry only if it is still `connection_id`.
    ///
    /// Socket teardown calls this so a replaced connection never evicts its
    /// successor. Returns `true` if the entry was removed.
    pub fn unregister_connection(&self, user: &UserId, connection_id: ConnectionId) -> bool {
        self.evict(user, connection_id, UnregisterReason::Closed)
    }

    #[must_use]
    pub fn is_local(&self, user: &UserId) -> bool {
        self.connections
            .get(user)
            .is_some_and(|entry| entry.value().is_open())
    }

    /// Connection currently registered for `user`.
    #[must_use]
    pub fn get(&self, user: &UserId) -> Option<Arc<Connection>> {
        self.connections
            .get(user)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Encode and send `envelope` to `user`'s local connection.
    pub async fn send_local(&self, user: &UserId, envelope: &Envelope) -> DeliveryResult {
        match envelope.to_json() {
            Ok(json) => self.send_frame(user, Arc::from(json)).await,
            Err(e) => {
                error!(
                    target: "chat.registry",
                    error = %e,
                    message_id = %envelope.message_id,
                    "Failed to encode envelope"
                );
                DeliveryResult::TransportError
            }
        }
    }

    /// Send an already-encoded frame to `user`'s local connection.
    ///
    /// Never waits longer than the write timeout. Timeouts and dead writers
    /// evict the connection and report `TransportError`.
    pub async fn send_frame(&self, user: &UserId, frame: Arc<str>) -> DeliveryResult {
        let Some(connection) = self.get(user) else {
            metrics::record_delivery(DeliveryResult::NotLocal.as_str());
            return DeliveryResult::NotLocal;
        };

        let result = if connection.cancel_token().is_cancelled() {
            // torn down but not yet unregistered
            self.evict(user, connection.id(), UnregisterReason::Closed);
            DeliveryResult::NotLocal
        } else if connection.send_frame(frame, self.write_timeout).await {
            DeliveryResult::Delivered
        } else {
            self.evict(user, connection.id(), UnregisterReason::TransportFailure);
            DeliveryResult::TransportError
        };

        metrics::record_delivery(result.as_str());
        result
    }

    /// Send `envelope` to every local connection. Returns how many accepted it.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let frame: Arc<str> = match envelope.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!(target: "chat.registry", error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        let users = self.local_users();
        let sends = users
            .iter()
            .map(|user| self.send_frame(user, Arc::clone(&frame)));
        join_all(sends)
            .await
            .into_iter()
            .filter(|result| *result == DeliveryResult::Delivered)
            .count()
    }

    #[must_use]
    pub fn local_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn local_users(&self) -> Vec<UserId> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Close and remove every connection (shutdown).
    pub fn close_all(&self) -> usize {
        let users = self.local_users();
        let mut closed = 0;
        for user in users {
            if self.unregister(&user).is_some() {
                closed += 1;
            }
        }
        closed
    }

    fn evict(&self, user: &UserId, connection_id: ConnectionId, reason: UnregisterReason) -> bool {
        match self
            .connections
            .remove_if(user, |_, current| current.id() == connection_id)
        {
            Some((_, connection)) => {
                self.finish_removal(&connection, reason);
                true
            }
            None => false,
        }
    }

    fn finish_removal(&self, connection: &Connection, reason: UnregisterReason) {
        connection.close();
        debug!(
            target: "chat.registry",
            user_id = %connection.user(),
            connection_id = %connection.id(),
            reason = ?reason,
            "Unregistered connection"
        );
        self.emit(RegistryEvent::Unregistered {
            user: connection.user().clone(),
            connection_id: connection.id(),
            reason,
        });
        metrics::set_connections_active(self.connections.len());
    }

    fn emit(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::{Audience, ChatPayload, Payload};
    use common::types::RoomId;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    fn chat_to(receiver: &str) -> Envelope {
        Envelope::new(
            Some(user("sender")),
            Audience::User(user(receiver)),
            Payload::Chat(ChatPayload::text("hello")),
        )
        .unwrap()
    }

    fn connect(id: &str) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        Connection::new(user(id), 8, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_register_then_send_local() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let (conn, mut rx) = connect("alice");
        registry.register(conn);

        assert!(registry.is_local(&user("alice")));
        assert_eq!(
            registry.send_local(&user("alice"), &chat_to("alice")).await,
            DeliveryResult::Delivered
        );
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"kind\":\"CHAT\""));
    }

    #[tokio::test]
    async fn test_send_to_unknown_user_is_not_local() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        assert_eq!(
            registry.send_local(&user("ghost"), &chat_to("ghost")).await,
            DeliveryResult::NotLocal
        );
    }

    #[tokio::test]
    async fn test_replacement_closes_old_and_routes_to_new() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let (first, mut first_rx) = connect("alice");
        let (second, mut second_rx) = connect("alice");
        let first_id = first.id();

        registry.register(Arc::clone(&first));
        let replaced = registry.register(Arc::clone(&second)).unwrap();

        assert_eq!(replaced.id(), first_id);
        assert!(!first.is_open());
        assert!(registry.is_local(&user("alice")));
        assert_eq!(registry.local_count(), 1);

        registry.send_local(&user("alice"), &chat_to("alice")).await;
        assert!(second_rx.try_recv().is_ok());
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_teardown_does_not_evict_successor() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let (first, _first_rx) = connect("alice");
        let (second, _second_rx) = connect("alice");
        let first_id = first.id();
        let second_id = second.id();

        registry.register(first);
        registry.register(second);

        assert!(!registry.unregister_connection(&user("alice"), first_id));
        assert!(registry.is_local(&user("alice")));

        assert!(registry.unregister_connection(&user("alice"), second_id));
        assert!(!registry.is_local(&user("alice")));
    }

    #[tokio::test]
    async fn test_dead_writer_is_transport_error_and_evicted() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let mut events = registry.subscribe();
        let (conn, rx) = connect("alice");
        registry.register(conn);
        drop(rx);

        assert_eq!(
            registry.send_local(&user("alice"), &chat_to("alice")).await,
            DeliveryResult::TransportError
        );
        assert!(!registry.is_local(&user("alice")));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::Unregistered { reason, .. } = event {
                saw_failure |= reason == UnregisterReason::TransportFailure;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_times_out() {
        let registry = ConnectionRegistry::new(Duration::from_millis(100));
        let (conn, _rx) = Connection::new(user("slow"), 1, CancellationToken::new());
        registry.register(conn);

        assert_eq!(
            registry.send_local(&user("slow"), &chat_to("slow")).await,
            DeliveryResult::Delivered
        );
        // queue is full and nobody drains it
        assert_eq!(
            registry.send_local(&user("slow"), &chat_to("slow")).await,
            DeliveryResult::TransportError
        );
        assert!(!registry.is_local(&user("slow")));
    }

    #[tokio::test]
    async fn test_cancelled_connection_is_not_local() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let (conn, _rx) = connect("alice");
        registry.register(Arc::clone(&conn));
        conn.close();

        assert!(!registry.is_local(&user("alice")));
        assert_eq!(
            registry.send_local(&user("alice"), &chat_to("alice")).await,
            DeliveryResult::NotLocal
        );
        assert_eq!(registry.local_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_local_connection() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (conn, rx) = connect(id);
            registry.register(conn);
            receivers.push(rx);
        }

        let announcement = Envelope::new(
            None,
            Audience::Room(RoomId::parse("lobby").unwrap()),
            Payload::System(crate::protocol::SystemPayload {
                content: "maintenance at noon".to_string(),
                code: "ANNOUNCEMENT".to_string(),
                data: None,
            }),
        )
        .unwrap();

        assert_eq!(registry.broadcast(&announcement).await, 3);
        for rx in &mut receivers {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let (a, _a_rx) = connect("a");
        let (b, _b_rx) = connect("b");
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.local_count(), 0);
        assert!(!a.is_open());
        assert!(!b.is_open());
    }

    #[tokio::test]
    async fn test_concurrent_registrations() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(1)));
        let mut handles = Vec::new();
        for i in 0..200 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (conn, rx) = Connection::new(
                    UserId::parse(format!("user-{i}")).unwrap(),
                    4,
                    CancellationToken::new(),
                );
                registry.register(conn);
                rx
            }));
        }
        let mut receivers = Vec::new();
        for handle in handles {
            receivers.push(handle.await.unwrap());
        }
        assert_eq!(registry.local_count(), 200);
    }
}
