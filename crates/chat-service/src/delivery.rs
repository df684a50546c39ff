//! Presence and delivery.
//!
//! Owns the per-user lifecycle and routes every envelope by kind:
//!
//! | kind          | path                                                   |
//! |---------------|--------------------------------------------------------|
//! | Chat (user)   | local send, else publish; mailbox if offline or failed |
//! | Chat (room)   | publish; mailbox for members offline everywhere        |
//! | Typing        | publish only, errors dropped                           |
//! | Join / Leave  | update membership, then publish to the room            |
//! | Notification  | publish; mailbox if offline or failed                  |
//! | System        | local only                                             |
//!
//! Envelopes received from the broker go through [`InboundHandler`]: local
//! delivery only, never re-published and never mailboxed. Mailbox entries
//! are written once, by the instance the message originated on.
//!
//! # Lifecycle
//!
//! Connect: register, mark online, send the `CONNECTED` ack, then deliver
//! pending mailbox entries oldest first. Disconnect: unregister (only the
//! same connection) and remove this instance from the user's presence. If
//! no other live instance holds the user, publish a Disconnect event to each
//! of their rooms. Membership is left untouched.
//!
//! A background heartbeat keeps this instance's presence entries alive;
//! users of an instance that stops beating go offline after the presence
//! TTL.

use crate::archive::{spawn_archive, MessageArchive};
use crate::config::Config;
use crate::errors::ChatError;
use crate::fanout::{FanoutPublisher, InboundHandler};
use crate::observability::metrics;
use crate::protocol::{
    decode_client_frame, Audience, ChatPayload, DecodeError, Envelope, MessageKind,
    NotificationPayload, Payload, Priority, CONNECTED_CODE, DELIVERY_FAILED_CODE,
    INVALID_MESSAGE_CODE,
};
use crate::registry::{
    Connection, ConnectionRegistry, DeliveryResult, RegistryEvent, UnregisterReason,
};
use crate::rooms::RoomMembershipTracker;
use crate::store::{MailboxStore, PresenceStore, Stores};
use async_trait::async_trait;
use common::types::{ConnectionId, RoomId, UserId};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Delivery settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub instance_id: String,
    pub chat_channel: String,
    pub notification_channel: String,
    pub max_content_length: usize,
}

impl DeliverySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            chat_channel: config.chat_channel.clone(),
            notification_channel: config.notification_channel.clone(),
            max_content_length: config.max_content_length,
        }
    }

    /// Both broker channels, for the subscriber.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        vec![self.chat_channel.clone(), self.notification_channel.clone()]
    }
}

/// Control-API notification request.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub receiver: UserId,
    pub title: String,
    pub content: String,
    pub notification_type: Option<String>,
    pub priority: Priority,
    pub action_url: Option<String>,
}

pub struct DeliveryService {
    settings: DeliverySettings,
    registry: Arc<ConnectionRegistry>,
    rooms: RoomMembershipTracker,
    mailbox: Arc<dyn MailboxStore>,
    presence: Arc<dyn PresenceStore>,
    publisher: FanoutPublisher,
    archive: Arc<dyn MessageArchive>,
}

impl DeliveryService {
    #[must_use]
    pub fn new(
        settings: DeliverySettings,
        registry: Arc<ConnectionRegistry>,
        stores: Stores,
        publisher: FanoutPublisher,
        archive: Arc<dyn MessageArchive>,
    ) -> Self {
        Self {
            settings,
            registry,
            rooms: RoomMembershipTracker::new(stores.membership),
            mailbox: stores.mailbox,
            presence: stores.presence,
            publisher,
            archive,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomMembershipTracker {
        &self.rooms
    }

    #[must_use]
    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bring a freshly authenticated connection online.
    #[instrument(skip_all, fields(user_id = %connection.user(), connection_id = %connection.id()))]
    pub async fn connect(&self, connection: Arc<Connection>) {
        let user = connection.user().clone();
        self.registry.register(Arc::clone(&connection));

        if let Err(e) = self
            .presence
            .mark_online(&user, &self.settings.instance_id)
            .await
        {
            warn!(target: "chat.delivery", error = %e, "Failed to record presence");
        }

        let ack = Envelope::system(
            user.clone(),
            CONNECTED_CODE,
            "Connected",
            Some(serde_json::json!({ "userId": user.as_str() })),
        );
        if self.registry.send_local(&user, &ack).await != DeliveryResult::Delivered {
            debug!(target: "chat.delivery", "Connection gone before ack");
            return;
        }

        self.deliver_pending(&user).await;
        info!(target: "chat.delivery", "User online");
    }

    /// Tear down after a socket closed.
    ///
    /// Only `connection_id` is unregistered; a successor connection for the
    /// same user is left alone.
    #[instrument(skip_all, fields(user_id = %user, connection_id = %connection_id))]
    pub async fn disconnect(&self, user: &UserId, connection_id: ConnectionId) {
        let removed = self.registry.unregister_connection(user, connection_id);
        if removed || self.registry.get(user).is_none() {
            self.user_gone(user).await;
        } else {
            debug!(target: "chat.delivery", "Connection was replaced, user stays online");
        }
    }

    /// Release presence and tell the user's rooms.
    ///
    /// The Disconnect events go out only if this release took the user
    /// offline, so a user still connected to another instance is not
    /// announced as gone, and a second release for the same connection
    /// announces nothing.
    async fn user_gone(&self, user: &UserId) {
        match self
            .presence
            .mark_offline(user, &self.settings.instance_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(target: "chat.delivery", user_id = %user, "User still online elsewhere");
                return;
            }
            Err(e) => {
                warn!(target: "chat.delivery", user_id = %user, error = %e, "Failed to release presence");
            }
        }

        let rooms = match self.rooms.rooms_of(user).await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(target: "chat.delivery", user_id = %user, error = %e, "Failed to list rooms");
                return;
            }
        };

        for room in rooms {
            let event = Envelope::disconnect(user.clone(), room);
            // soft failure, already logged by the publisher
            let _ = self
                .publisher
                .publish(&self.settings.chat_channel, &event)
                .await;
        }
        info!(target: "chat.delivery", user_id = %user, "User offline");
    }

    /// Deliver and remove pending mailbox entries, oldest first.
    ///
    /// Entries not delivered because the connection went away are put back
    /// at the head of the mailbox.
    async fn deliver_pending(&self, user: &UserId) {
        let pending = match self.mailbox.drain(user).await {
            Ok(pending) => pending,
            Err(e) => {
                metrics::record_mailbox("failed", 1);
                warn!(target: "chat.delivery", error = %e, "Failed to drain mailbox");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let total = pending.len();
        let mut delivered = 0;
        for envelope in &pending {
            if self.registry.send_local(user, envelope).await != DeliveryResult::Delivered {
                break;
            }
            delivered += 1;
        }

        if let Some(undelivered) = pending.get(delivered..).filter(|rest| !rest.is_empty()) {
            match self.mailbox.requeue_front(user, undelivered).await {
                Ok(result) => {
                    debug!(
                        target: "chat.delivery",
                        requeued = undelivered.len(),
                        pending = result.pending,
                        "Connection gone, mailbox entries put back"
                    );
                    if result.dropped > 0 {
                        metrics::record_mailbox("dropped", result.dropped as u64);
                    }
                }
                Err(e) => {
                    metrics::record_mailbox("failed", undelivered.len() as u64);
                    error!(target: "chat.delivery", error = %e, "Failed to put back mailbox entries");
                }
            }
        }

        metrics::record_mailbox("drained", delivered as u64);
        info!(
            target: "chat.delivery",
            delivered = delivered,
            pending = total,
            "Delivered mailbox"
        );
    }

    /// Follow registry evictions caused by transport failures.
    ///
    /// Socket teardown goes through [`disconnect`](Self::disconnect); this
    /// covers connections the registry dropped on its own.
    pub fn spawn_registry_listener(
        self: &Arc<Self>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel_token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(RegistryEvent::Unregistered {
                        user,
                        reason: UnregisterReason::TransportFailure,
                        ..
                    }) => service.user_gone(&user).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "chat.delivery", skipped = skipped, "Registry listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(target: "chat.delivery", "Registry listener stopped");
        })
    }

    /// Keep this instance's presence alive.
    ///
    /// Beats every `interval` and reaps instances whose heartbeat lapsed. If
    /// the store had forgotten this instance (for example after a long
    /// stall), every local user is marked online again.
    pub fn spawn_presence_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                target: "chat.delivery",
                interval_ms = interval.as_millis(),
                "Starting presence heartbeat"
            );

            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = ticker.tick() => service.beat().await,
                }
            }
            debug!(target: "chat.delivery", "Presence heartbeat stopped");
        })
    }

    async fn beat(&self) {
        let instance_id = &self.settings.instance_id;
        match self.presence.heartbeat(instance_id).await {
            Ok(beat) => {
                if beat.reaped > 0 {
                    warn!(
                        target: "chat.delivery",
                        reaped = beat.reaped,
                        "Reaped instances with lapsed heartbeats"
                    );
                }
                if !beat.known {
                    for user in self.registry.local_users() {
                        if let Err(e) = self.presence.mark_online(&user, instance_id).await {
                            warn!(target: "chat.delivery", user_id = %user, error = %e, "Failed to restore presence");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(target: "chat.delivery", error = %e, "Presence heartbeat failed");
            }
        }
    }

    /// Close every local connection (shutdown).
    pub fn close_all(&self) -> usize {
        self.registry.close_all()
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    /// Decode and dispatch one text frame from `connection`.
    ///
    /// Never fails: a bad frame or failed dispatch is answered with an
    /// Error frame to the sender.
    pub async fn handle_client_frame(&self, connection: &Connection, text: &str) {
        connection.touch();
        let user = connection.user();

        match decode_client_frame(text, user, self.settings.max_content_length) {
            Ok(envelope) => {
                if let Err(e) = self.dispatch(envelope).await {
                    self.send_error(user, DELIVERY_FAILED_CODE, e.client_message())
                        .await;
                }
            }
            Err(e) => {
                metrics::record_decode_error("client");
                metrics::record_message("INVALID", "rejected");
                warn!(
                    target: "chat.delivery",
                    user_id = %user,
                    error = %e,
                    "Rejected client frame"
                );
                self.send_error(user, INVALID_MESSAGE_CODE, e.to_string()).await;
            }
        }
    }

    async fn send_error(&self, user: &UserId, code: &str, content: String) {
        let frame = Envelope::error(user.clone(), code, content);
        self.registry.send_local(user, &frame).await;
    }

    /// Route a validated envelope by kind.
    ///
    /// # Errors
    ///
    /// Returns the membership or mailbox error for kinds that depend on
    /// them, and `ChatError::Decode` for kinds this path does not route.
    #[instrument(skip_all, fields(kind = %envelope.kind(), message_id = %envelope.message_id))]
    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), ChatError> {
        let kind = envelope.kind();
        let start = Instant::now();

        let result = match (&envelope.payload, &envelope.audience) {
            (Payload::Chat(_), Audience::User(receiver)) => {
                let receiver = receiver.clone();
                self.send_direct(&receiver, &envelope, &self.settings.chat_channel)
                    .await;
                spawn_archive(&self.archive, envelope);
                Ok(())
            }
            (Payload::Chat(_), Audience::Room(room)) => {
                let room = room.clone();
                self.send_to_room(&room, &envelope).await;
                spawn_archive(&self.archive, envelope);
                Ok(())
            }
            (Payload::Typing(_), _) => {
                if let Err(e) = self
                    .publisher
                    .publish(&self.settings.chat_channel, &envelope)
                    .await
                {
                    debug!(target: "chat.delivery", error = %e, "Dropped typing indicator");
                }
                Ok(())
            }
            (Payload::Join(_), Audience::Room(room)) => {
                self.change_membership(room, &envelope, true).await
            }
            (Payload::Leave(_), Audience::Room(room)) => {
                self.change_membership(room, &envelope, false).await
            }
            (Payload::Notification(_), Audience::User(receiver)) => {
                let receiver = receiver.clone();
                self.send_direct(&receiver, &envelope, &self.settings.notification_channel)
                    .await;
                spawn_archive(&self.archive, envelope);
                Ok(())
            }
            (Payload::System(_), _) => {
                self.deliver_local(&envelope).await;
                Ok(())
            }
            _ => Err(ChatError::Decode(DecodeError::NotAcceptedFromClient(kind))),
        };

        metrics::record_message(
            kind.as_str(),
            if result.is_ok() { "dispatched" } else { "failed" },
        );
        metrics::record_message_latency(kind.as_str(), start.elapsed());
        result
    }

    async fn change_membership(
        &self,
        room: &RoomId,
        envelope: &Envelope,
        join: bool,
    ) -> Result<(), ChatError> {
        let Some(user) = envelope.sender_id.as_ref() else {
            return Err(ChatError::Decode(DecodeError::MissingField("senderId")));
        };
        if join {
            self.rooms.join(room, user).await?;
        } else {
            self.rooms.leave(room, user).await?;
        }
        // soft failure, already logged by the publisher
        let _ = self
            .publisher
            .publish(&self.settings.chat_channel, envelope)
            .await;
        Ok(())
    }

    /// Chat to one user or a notification.
    ///
    /// Chat tries the local connection first; notifications always go
    /// through the broker. The presence lookup runs alongside the publish.
    /// A local transport failure means the receiver's connection here is
    /// gone, so presence is released before the lookup.
    async fn send_direct(&self, receiver: &UserId, envelope: &Envelope, channel: &str) {
        if envelope.kind() == MessageKind::Chat {
            match self.registry.send_local(receiver, envelope).await {
                DeliveryResult::Delivered => return,
                DeliveryResult::TransportError => self.user_gone(receiver).await,
                DeliveryResult::NotLocal => {}
            }
        }

        let (published, online) = tokio::join!(
            self.publisher.publish(channel, envelope),
            self.presence.is_online(receiver),
        );

        let offline = match online {
            Ok(online) => !online,
            Err(e) => {
                debug!(target: "chat.delivery", error = %e, "Presence lookup failed, assuming online");
                false
            }
        };

        if published.is_err() || offline {
            self.enqueue(receiver, envelope).await;
        }
    }

    /// Chat to a room.
    ///
    /// Members offline on every instance get a mailbox entry. If the publish
    /// definitely failed, local members are served directly and every other
    /// member is mailboxed. A timed-out publish may have reached the broker,
    /// so it only gets the offline-member fallback.
    async fn send_to_room(&self, room: &RoomId, envelope: &Envelope) {
        let sender = envelope.sender_id.as_ref();
        let (published, members) = tokio::join!(
            self.publisher.publish(&self.settings.chat_channel, envelope),
            self.rooms.members(room),
        );

        let members: Vec<UserId> = match members {
            Ok(members) => members
                .into_iter()
                .filter(|member| Some(member) != sender)
                .collect(),
            Err(e) => {
                warn!(target: "chat.delivery", room_id = %room, error = %e, "Failed to list room members");
                return;
            }
        };

        if matches!(published, Err(ref e) if !matches!(e, ChatError::PublishTimeout)) {
            for member in &members {
                if self.registry.send_local(member, envelope).await != DeliveryResult::Delivered {
                    self.enqueue(member, envelope).await;
                }
            }
            return;
        }

        let lookups = members.iter().map(|member| self.presence.is_online(member));
        let online = join_all(lookups).await;
        for (member, online) in members.iter().zip(online) {
            if matches!(online, Ok(false)) {
                self.enqueue(member, envelope).await;
            }
        }
    }

    async fn enqueue(&self, user: &UserId, envelope: &Envelope) {
        match self.mailbox.append(user, envelope).await {
            Ok(result) => {
                metrics::record_mailbox("enqueued", 1);
                if result.dropped > 0 {
                    metrics::record_mailbox("dropped", result.dropped as u64);
                    warn!(
                        target: "chat.delivery",
                        user_id = %user,
                        dropped = result.dropped,
                        "Mailbox full, dropped oldest entries"
                    );
                }
                debug!(target: "chat.delivery", user_id = %user, pending = result.pending, "Mailboxed");
            }
            Err(e) => {
                metrics::record_mailbox("failed", 1);
                error!(target: "chat.delivery", user_id = %user, error = %e, "Failed to mailbox envelope");
            }
        }
    }

    /// Deliver to local connections only, by audience.
    async fn deliver_local(&self, envelope: &Envelope) {
        match &envelope.audience {
            Audience::User(user) => {
                self.registry.send_local(user, envelope).await;
            }
            Audience::Room(room) => {
                let members = match self.rooms.members(room).await {
                    Ok(members) => members,
                    Err(e) => {
                        warn!(target: "chat.delivery", room_id = %room, error = %e, "Failed to list room members");
                        return;
                    }
                };
                self.deliver_to_members(members, envelope).await;
            }
            Audience::Broadcast => {
                self.registry.broadcast(envelope).await;
            }
        }
    }

    async fn deliver_to_members(&self, members: HashSet<UserId>, envelope: &Envelope) {
        let sender = envelope.sender_id.as_ref();
        let sends = members
            .iter()
            .filter(|member| Some(*member) != sender && self.registry.is_local(member))
            .map(|member| self.registry.send_local(member, envelope));
        join_all(sends).await;
    }

    // ------------------------------------------------------------------
    // Control operations
    // ------------------------------------------------------------------

    /// Send a chat message to one user on behalf of `sender`.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Decode` for invalid content.
    pub async fn send_private_message(
        &self,
        sender: UserId,
        receiver: UserId,
        content: String,
    ) -> Result<Envelope, ChatError> {
        let envelope = Envelope::new(
            Some(sender),
            Audience::User(receiver),
            Payload::Chat(ChatPayload::text(content)),
        )?;
        envelope.validate_content(self.settings.max_content_length)?;
        self.dispatch(envelope.clone()).await?;
        Ok(envelope)
    }

    /// Send a chat message to a room on behalf of `sender`.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Decode` for invalid content.
    pub async fn send_room_message(
        &self,
        sender: UserId,
        room: RoomId,
        content: String,
    ) -> Result<Envelope, ChatError> {
        let envelope = Envelope::new(
            Some(sender),
            Audience::Room(room),
            Payload::Chat(ChatPayload::text(content)),
        )?;
        envelope.validate_content(self.settings.max_content_length)?;
        self.dispatch(envelope.clone()).await?;
        Ok(envelope)
    }

    /// Send a server notification.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::BadRequest` for a blank title.
    pub async fn send_notification(
        &self,
        request: NotificationRequest,
    ) -> Result<Envelope, ChatError> {
        if request.title.trim().is_empty() {
            return Err(ChatError::BadRequest("title must not be blank".to_string()));
        }
        let envelope = Envelope::new(
            None,
            Audience::User(request.receiver),
            Payload::Notification(NotificationPayload {
                title: request.title,
                content: request.content,
                notification_type: request
                    .notification_type
                    .unwrap_or_else(|| "GENERAL".to_string()),
                priority: request.priority,
                action_url: request.action_url,
            }),
        )?;
        self.dispatch(envelope.clone()).await?;
        Ok(envelope)
    }

    /// Users online anywhere in the cluster.
    ///
    /// # Errors
    ///
    /// Returns the presence store error.
    pub async fn online_count(&self) -> Result<usize, ChatError> {
        self.presence.online_count().await
    }

    /// # Errors
    ///
    /// Returns the presence store error.
    pub async fn is_online(&self, user: &UserId) -> Result<bool, ChatError> {
        self.presence.is_online(user).await
    }

    /// # Errors
    ///
    /// Returns the membership store error.
    pub async fn participant_count(&self, room: &RoomId) -> Result<usize, ChatError> {
        self.rooms.member_count(room).await
    }

    /// Remove and return `user`'s pending mailbox entries.
    ///
    /// # Errors
    ///
    /// Returns the mailbox store error.
    pub async fn take_mailbox(&self, user: &UserId) -> Result<Vec<Envelope>, ChatError> {
        let entries = self.mailbox.drain(user).await?;
        metrics::record_mailbox("drained", entries.len() as u64);
        Ok(entries)
    }

    /// Account deletion: leave every room.
    ///
    /// # Errors
    ///
    /// Returns the membership store error.
    pub async fn remove_user_rooms(&self, user: &UserId) -> Result<Vec<RoomId>, ChatError> {
        self.rooms.remove_user(user).await
    }
}

#[async_trait]
impl InboundHandler for DeliveryService {
    async fn handle_inbound(&self, channel: &str, envelope: Envelope) {
        debug!(
            target: "chat.delivery",
            channel = %channel,
            kind = %envelope.kind(),
            message_id = %envelope.message_id,
            "Delivering broker envelope"
        );
        self.deliver_local(&envelope).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::archive::NoopArchive;
    use crate::fanout::LocalBroker;
    use crate::protocol::JoinPayload;
    use crate::store::{InMemoryStore, MailboxAppend};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    fn settings() -> DeliverySettings {
        DeliverySettings {
            instance_id: "chat-test".to_string(),
            chat_channel: "chat".to_string(),
            notification_channel: "notification".to_string(),
            max_content_length: 100,
        }
    }

    fn service(store: Arc<InMemoryStore>, broker: Arc<LocalBroker>) -> DeliveryService {
        DeliveryService::new(
            settings(),
            Arc::new(ConnectionRegistry::new(Duration::from_secs(1))),
            Stores::shared(store),
            FanoutPublisher::new(broker, Duration::from_secs(1), 1),
            Arc::new(NoopArchive),
        )
    }

    fn setup() -> (DeliveryService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new(10, Duration::from_secs(60)));
        (service(Arc::clone(&store), Arc::new(LocalBroker::new())), store)
    }

    async fn connect(
        service: &DeliveryService,
        id: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        let (connection, rx) = Connection::new(user(id), 16, CancellationToken::new());
        service.connect(Arc::clone(&connection)).await;
        (connection, rx)
    }

    fn frame(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    fn notification(to: &str, title: &str) -> Envelope {
        Envelope::new(
            None,
            Audience::User(user(to)),
            Payload::Notification(NotificationPayload {
                title: title.to_string(),
                content: "body".to_string(),
                notification_type: "GENERAL".to_string(),
                priority: Priority::Normal,
                action_url: None,
            }),
        )
        .unwrap()
    }

    fn title(envelope: &Envelope) -> String {
        match &envelope.payload {
            Payload::Notification(n) => n.title.clone(),
            _ => String::new(),
        }
    }

    /// Queues `late` right after every drain, as if it arrived mid-delivery.
    struct LateArrival {
        inner: Arc<InMemoryStore>,
        late: Envelope,
    }

    #[async_trait]
    impl MailboxStore for LateArrival {
        async fn append(
            &self,
            user: &UserId,
            envelope: &Envelope,
        ) -> Result<MailboxAppend, ChatError> {
            self.inner.append(user, envelope).await
        }

        async fn drain(&self, user: &UserId) -> Result<Vec<Envelope>, ChatError> {
            let drained = self.inner.drain(user).await?;
            self.inner.append(user, &self.late).await?;
            Ok(drained)
        }

        async fn requeue_front(
            &self,
            user: &UserId,
            envelopes: &[Envelope],
        ) -> Result<MailboxAppend, ChatError> {
            self.inner.requeue_front(user, envelopes).await
        }

        async fn pending(&self, user: &UserId) -> Result<usize, ChatError> {
            self.inner.pending(user).await
        }
    }

    #[tokio::test]
    async fn test_connect_acks_and_marks_online() {
        let (service, store) = setup();
        let (_conn, mut rx) = connect(&service, "alice").await;

        let ack = frame(&mut rx);
        assert_eq!(ack["kind"], "SYSTEM");
        assert_eq!(ack["code"], CONNECTED_CODE);
        assert!(store.is_online(&user("alice")).await.unwrap());
        assert!(service.registry().is_local(&user("alice")));
    }

    #[tokio::test]
    async fn test_private_chat_to_local_user() {
        let (service, _store) = setup();
        let (alice, _alice_rx) = connect(&service, "alice").await;
        let (_bob, mut bob_rx) = connect(&service, "bob").await;
        frame(&mut bob_rx);

        service
            .handle_client_frame(&alice, r#"{"kind":"CHAT","receiverId":"bob","content":"hi"}"#)
            .await;

        let received = frame(&mut bob_rx);
        assert_eq!(received["kind"], "CHAT");
        assert_eq!(received["senderId"], "alice");
        assert_eq!(received["content"], "hi");
    }

    #[tokio::test]
    async fn test_private_chat_to_offline_user_is_mailboxed() {
        let (service, store) = setup();
        let (alice, _rx) = connect(&service, "alice").await;

        service
            .handle_client_frame(&alice, r#"{"kind":"CHAT","receiverId":"carol","content":"later"}"#)
            .await;

        assert_eq!(store.pending(&user("carol")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_frame_gets_error_reply() {
        let (service, _store) = setup();
        let (alice, mut rx) = connect(&service, "alice").await;
        frame(&mut rx);

        service
            .handle_client_frame(&alice, r#"{"kind":"CHAT","content":"nowhere"}"#)
            .await;
        let reply = frame(&mut rx);
        assert_eq!(reply["kind"], "ERROR");
        assert_eq!(reply["code"], INVALID_MESSAGE_CODE);

        service.handle_client_frame(&alice, "garbage").await;
        assert_eq!(frame(&mut rx)["kind"], "ERROR");
    }

    #[tokio::test]
    async fn test_join_then_disconnect_keeps_membership() {
        let (service, store) = setup();
        let (alice, _rx) = connect(&service, "alice").await;

        service
            .handle_client_frame(&alice, r#"{"kind":"JOIN","roomId":"group_1","userName":"Alice"}"#)
            .await;
        let room = RoomId::group("1").unwrap();
        assert_eq!(service.participant_count(&room).await.unwrap(), 1);

        service.disconnect(&user("alice"), alice.id()).await;
        assert!(!store.is_online(&user("alice")).await.unwrap());
        assert!(service
            .rooms()
            .rooms_of(&user("alice"))
            .await
            .unwrap()
            .contains(&room));
    }

    #[tokio::test]
    async fn test_replaced_connection_teardown_keeps_user_online() {
        let (service, store) = setup();
        let (first, _rx1) = connect(&service, "alice").await;
        let (_second, _rx2) = connect(&service, "alice").await;

        service.disconnect(&user("alice"), first.id()).await;
        assert!(service.registry().is_local(&user("alice")));
        assert!(store.is_online(&user("alice")).await.unwrap());
    }

    #[tokio::test]
    async fn test_mailbox_delivered_after_ack() {
        let (service, store) = setup();
        service
            .send_notification(NotificationRequest {
                receiver: user("carol"),
                title: "Welcome".to_string(),
                content: "hello".to_string(),
                notification_type: None,
                priority: Priority::High,
                action_url: None,
            })
            .await
            .unwrap();
        assert_eq!(store.pending(&user("carol")).await.unwrap(), 1);

        let (_conn, mut rx) = connect(&service, "carol").await;
        assert_eq!(frame(&mut rx)["code"], CONNECTED_CODE);
        let notification = frame(&mut rx);
        assert_eq!(notification["kind"], "NOTIFICATION");
        assert_eq!(notification["notificationType"], "GENERAL");
        assert_eq!(notification["priority"], "HIGH");
        assert_eq!(store.pending(&user("carol")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inbound_room_delivery_skips_sender_and_non_members() {
        let (service, _store) = setup();
        let room = RoomId::group("9").unwrap();
        let (_a, mut a_rx) = connect(&service, "alice").await;
        let (_b, mut b_rx) = connect(&service, "bob").await;
        let (_c, mut c_rx) = connect(&service, "carol").await;
        for rx in [&mut a_rx, &mut b_rx, &mut c_rx] {
            frame(rx);
        }
        service.rooms().join(&room, &user("alice")).await.unwrap();
        service.rooms().join(&room, &user("bob")).await.unwrap();

        let envelope = Envelope::new(
            Some(user("alice")),
            Audience::Room(room),
            Payload::Join(JoinPayload::default()),
        )
        .unwrap();
        service.handle_inbound("chat", envelope).await;

        assert_eq!(frame(&mut b_rx)["kind"], "JOIN");
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_operations() {
        let (service, _store) = setup();
        let (_conn, _rx) = connect(&service, "alice").await;
        let room = RoomId::group("x").unwrap();
        service.rooms().join(&room, &user("alice")).await.unwrap();

        assert_eq!(service.online_count().await.unwrap(), 1);
        assert!(service.is_online(&user("alice")).await.unwrap());
        assert!(!service.is_online(&user("bob")).await.unwrap());

        let removed = service.remove_user_rooms(&user("alice")).await.unwrap();
        assert_eq!(removed, vec![room.clone()]);
        assert_eq!(service.participant_count(&room).await.unwrap(), 0);

        let result = service
            .send_private_message(user("alice"), user("bob"), "   ".to_string())
            .await;
        assert!(matches!(result, Err(ChatError::Decode(_))));
    }

    #[tokio::test]
    async fn test_private_chat_after_transport_failure_is_mailboxed() {
        let store = Arc::new(InMemoryStore::new(10, Duration::from_secs(60)));
        let broker = Arc::new(LocalBroker::new());
        let service = Arc::new(service(Arc::clone(&store), Arc::clone(&broker)));
        let cancel = CancellationToken::new();
        let listener = service.spawn_registry_listener(cancel.clone());

        let (bob, _bob_rx) = connect(&service, "bob").await;
        let (_carol, carol_rx) = connect(&service, "carol").await;
        service
            .rooms()
            .join(&RoomId::group("r").unwrap(), &user("carol"))
            .await
            .unwrap();
        drop(carol_rx);

        service
            .handle_client_frame(&bob, r#"{"kind":"CHAT","receiverId":"carol","content":"hi"}"#)
            .await;

        assert!(!service.registry().is_local(&user("carol")));
        assert!(!store.is_online(&user("carol")).await.unwrap());
        assert_eq!(store.pending(&user("carol")).await.unwrap(), 1);

        // the listener sees the same eviction but announces nothing twice
        tokio::time::sleep(Duration::from_millis(50)).await;
        // one Disconnect for carol's room, then the chat itself
        assert_eq!(broker.published_count(), 2);

        cancel.cancel();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_undelivered_mailbox_entries_go_back_to_the_front() {
        let store = Arc::new(InMemoryStore::new(10, Duration::from_secs(60)));
        let stores = Stores {
            membership: store.clone(),
            mailbox: Arc::new(LateArrival {
                inner: Arc::clone(&store),
                late: notification("carol", "late"),
            }),
            presence: store.clone(),
        };
        let service = DeliveryService::new(
            settings(),
            Arc::new(ConnectionRegistry::new(Duration::from_millis(20))),
            stores,
            FanoutPublisher::new(Arc::new(LocalBroker::new()), Duration::from_secs(1), 1),
            Arc::new(NoopArchive),
        );
        for t in ["1", "2", "3"] {
            store.append(&user("carol"), &notification("carol", t)).await.unwrap();
        }

        // room for the ack and one entry; the second entry times out
        let (connection, mut rx) = Connection::new(user("carol"), 2, CancellationToken::new());
        service.connect(connection).await;

        assert_eq!(frame(&mut rx)["code"], CONNECTED_CODE);
        assert_eq!(frame(&mut rx)["title"], "1");
        assert!(!service.registry().is_local(&user("carol")));

        let left: Vec<String> = store
            .drain(&user("carol"))
            .await
            .unwrap()
            .iter()
            .map(title)
            .collect();
        assert_eq!(left, vec!["2", "3", "late"]);
    }

    #[tokio::test]
    async fn test_heartbeat_restores_presence_after_being_reaped() {
        let store = Arc::new(
            InMemoryStore::new(10, Duration::from_secs(60)).with_presence_ttl(Duration::from_millis(50)),
        );
        let service = Arc::new(service(Arc::clone(&store), Arc::new(LocalBroker::new())));
        let (_conn, _rx) = connect(&service, "alice").await;

        // another instance reaps this one after a stall
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!store.is_online(&user("alice")).await.unwrap());
        store.heartbeat("chat-other").await.unwrap();

        let cancel = CancellationToken::new();
        let heartbeat = service.spawn_presence_heartbeat(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.is_online(&user("alice")).await.unwrap());

        cancel.cancel();
        heartbeat.await.unwrap();
    }
}
