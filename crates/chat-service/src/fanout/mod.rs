//! Cross-instance fanout.
//!
//! Every instance publishes outbound envelopes to a shared broker channel
//! and subscribes to the same channels, so a message published anywhere
//! reaches every instance exactly once per subscription.
//!
//! # Components
//!
//! - [`Broker`] - publish/subscribe seam ([`RedisBroker`], [`LocalBroker`])
//! - [`FanoutPublisher`] - encode, retry refused connections, bound by the
//!   publish timeout
//! - [`run_subscriber`] - decode each received payload and hand it to the
//!   local dispatch path
//!
//! Received envelopes are never re-published. Ordering is per publisher per
//! channel only.

pub mod local;
pub mod redis;

pub use local::LocalBroker;
pub use redis::RedisBroker;

use crate::errors::ChatError;
use crate::observability::{metrics, HealthState};
use crate::protocol::Envelope;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Delay before resubscribing after the subscription is lost.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Delay before the second publish attempt; doubles per attempt.
pub const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Buffer between a broker subscription and the subscriber loop.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// One payload received on a broker channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Shared message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `channel`. Succeeds even with no subscribers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ChatError>;

    /// Subscribe to `channels`. The receiver closes when the subscription
    /// is lost.
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<mpsc::Receiver<BrokerMessage>, ChatError>;
}

/// Receives decoded envelopes from the subscriber loop.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_inbound(&self, channel: &str, envelope: Envelope);
}

/// Publishes envelopes with an overall timeout and retry.
///
/// Only [`ChatError::BrokerUnreachable`] is retried: PUBLISH is not
/// idempotent, so an error or timeout after the command went out is final.
/// `publish_timeout` bounds the whole call, retries and backoff included.
#[derive(Clone)]
pub struct FanoutPublisher {
    broker: Arc<dyn Broker>,
    publish_timeout: Duration,
    retry: RetryPolicy,
}

impl FanoutPublisher {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, publish_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            broker,
            publish_timeout,
            retry: RetryPolicy::exponential(max_attempts, PUBLISH_RETRY_DELAY),
        }
    }

    /// Publish `envelope` on `channel`.
    ///
    /// A failure is soft: it is logged and returned, and the caller decides
    /// on a fallback. A timeout leaves the outcome unknown, since the broker
    /// may have accepted the command.
    ///
    /// # Errors
    ///
    /// - `ChatError::PublishTimeout` if the publish did not finish in time
    /// - `ChatError::BrokerUnreachable` if every attempt was refused
    /// - `ChatError::Broker` if the broker rejected the command
    /// - `ChatError::Internal` if the envelope could not be encoded
    #[instrument(skip_all, fields(channel = %channel, message_id = %envelope.message_id))]
    pub async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), ChatError> {
        let payload = envelope.to_json().map_err(|e| {
            error!(target: "chat.fanout", error = %e, "Failed to encode envelope");
            ChatError::Internal
        })?;

        let attempts = self.retry.run(
            "broker_publish",
            |e: &ChatError| matches!(e, ChatError::BrokerUnreachable(_)),
            || self.broker.publish(channel, &payload),
        );
        let result = tokio::time::timeout(self.publish_timeout, attempts)
            .await
            .unwrap_or(Err(ChatError::PublishTimeout));

        match &result {
            Ok(()) => {
                metrics::record_broker_publish(channel, "success");
                debug!(target: "chat.fanout", "Published envelope");
            }
            Err(ChatError::PublishTimeout) => {
                metrics::record_broker_publish(channel, "timeout");
                warn!(target: "chat.fanout", "Broker publish timed out");
            }
            Err(e) => {
                metrics::record_broker_publish(channel, "error");
                warn!(target: "chat.fanout", error = %e, "Broker publish failed");
            }
        }
        result
    }
}

/// Decode one broker payload. Undecodable payloads are counted and dropped.
fn decode_broker_message(message: &BrokerMessage) -> Option<Envelope> {
    metrics::record_broker_received(&message.channel);
    match Envelope::from_json(&message.payload) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            metrics::record_decode_error("broker");
            error!(
                target: "chat.fanout",
                channel = %message.channel,
                error = %e,
                "Dropping undecodable broker message"
            );
            None
        }
    }
}

/// Subscriber loop.
///
/// Subscribes to `channels`, marks the instance ready while subscribed and
/// hands each decoded envelope to `handler` in arrival order. A lost
/// subscription marks the instance not ready and resubscribes after
/// [`RESUBSCRIBE_DELAY`]. Returns when `cancel_token` is cancelled.
pub async fn run_subscriber(
    broker: Arc<dyn Broker>,
    channels: Vec<String>,
    handler: Arc<dyn InboundHandler>,
    health: Arc<HealthState>,
    cancel_token: CancellationToken,
) {
    loop {
        let subscription = tokio::select! {
            () = cancel_token.cancelled() => break,
            result = broker.subscribe(&channels) => result,
        };

        match subscription {
            Ok(mut messages) => {
                info!(target: "chat.fanout", channels = ?channels, "Subscribed to broker channels");
                health.set_ready();

                loop {
                    let message = tokio::select! {
                        () = cancel_token.cancelled() => {
                            info!(target: "chat.fanout", "Subscriber loop stopping");
                            return;
                        }
                        message = messages.recv() => message,
                    };
                    let Some(message) = message else {
                        break;
                    };
                    if let Some(envelope) = decode_broker_message(&message) {
                        handler.handle_inbound(&message.channel, envelope).await;
                    }
                }

                health.set_not_ready();
                warn!(target: "chat.fanout", "Broker subscription lost, resubscribing");
            }
            Err(e) => {
                warn!(target: "chat.fanout", error = %e, "Broker subscribe failed, retrying");
            }
        }

        tokio::select! {
            () = cancel_token.cancelled() => break,
            () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
    info!(target: "chat.fanout", "Subscriber loop stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::protocol::{Audience, ChatPayload, Payload};
    use common::types::{RoomId, UserId};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    fn chat_to_room() -> Envelope {
        Envelope::new(
            Some(UserId::parse("alice").unwrap()),
            Audience::Room(RoomId::parse("lobby").unwrap()),
            Payload::Chat(ChatPayload::text("hello")),
        )
        .unwrap()
    }

    /// Refuses the first `refusals` publishes, then accepts after `reply_delay`.
    ///
    /// `accepted` counts publishes that reached the broker, whether or not
    /// the caller waited for the reply.
    struct ScriptedBroker {
        refusals: u32,
        calls: AtomicU32,
        accepted: AtomicU32,
        reply_delay: Duration,
        reject: bool,
    }

    impl ScriptedBroker {
        fn new(refusals: u32, reply_delay: Duration) -> Self {
            Self {
                refusals,
                calls: AtomicU32::new(0),
                accepted: AtomicU32::new(0),
                reply_delay,
                reject: false,
            }
        }

        fn rejecting() -> Self {
            Self {
                reject: true,
                ..Self::new(0, Duration::ZERO)
            }
        }
    }

    #[async_trait]
    impl Broker for ScriptedBroker {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), ChatError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.refusals {
                return Err(ChatError::BrokerUnreachable("connection refused".to_string()));
            }
            if self.reject {
                return Err(ChatError::Broker("connection reset".to_string()));
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.reply_delay).await;
            Ok(())
        }

        async fn subscribe(
            &self,
            _channels: &[String],
        ) -> Result<mpsc::Receiver<BrokerMessage>, ChatError> {
            Err(ChatError::Broker("unsupported".to_string()))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Envelope)>>);

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn handle_inbound(&self, channel: &str, envelope: Envelope) {
            self.0.lock().await.push((channel.to_string(), envelope));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_refused_connection() {
        let broker = Arc::new(ScriptedBroker::new(2, Duration::ZERO));
        let publisher = FanoutPublisher::new(broker.clone(), Duration::from_secs(1), 3);

        publisher.publish("chat", &chat_to_room()).await.unwrap();
        assert_eq!(broker.calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_gives_up_after_max_attempts() {
        let broker = Arc::new(ScriptedBroker::new(u32::MAX, Duration::ZERO));
        let publisher = FanoutPublisher::new(broker.clone(), Duration::from_secs(1), 2);

        let result = publisher.publish("chat", &chat_to_room()).await;
        assert!(matches!(result, Err(ChatError::BrokerUnreachable(_))));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_does_not_retry_after_command_sent() {
        let broker = Arc::new(ScriptedBroker::rejecting());
        let publisher = FanoutPublisher::new(broker.clone(), Duration::from_secs(1), 3);

        let result = publisher.publish("chat", &chat_to_room()).await;
        assert!(matches!(result, Err(ChatError::Broker(_))));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_times_out_without_republishing() {
        // accepted, but the reply arrives after the timeout
        let broker = Arc::new(ScriptedBroker::new(0, Duration::from_millis(500)));
        let publisher = FanoutPublisher::new(broker.clone(), Duration::from_millis(100), 3);

        let result = publisher.publish("chat", &chat_to_room()).await;
        assert!(matches!(result, Err(ChatError::PublishTimeout)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_bounds_retries() {
        let broker = Arc::new(ScriptedBroker::new(u32::MAX, Duration::ZERO));
        let publisher = FanoutPublisher::new(broker.clone(), Duration::from_millis(250), 50);

        let start = tokio::time::Instant::now();
        let result = publisher.publish("chat", &chat_to_room()).await;
        assert!(matches!(result, Err(ChatError::PublishTimeout)));
        assert!(start.elapsed() <= Duration::from_millis(250));
        // 100ms then 200ms backoff: the third attempt never starts
        assert_eq!(broker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscriber_decodes_and_skips_garbage() {
        let broker = Arc::new(LocalBroker::new());
        let recorder = Arc::new(Recorder::default());
        let health = Arc::new(HealthState::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_subscriber(
            broker.clone(),
            vec!["chat".to_string()],
            recorder.clone(),
            Arc::clone(&health),
            cancel.clone(),
        ));

        while !health.is_ready() {
            tokio::task::yield_now().await;
        }

        let envelope = chat_to_room();
        broker.publish("chat", "{not json").await.unwrap();
        broker.publish("other", &envelope.to_json().unwrap()).await.unwrap();
        broker.publish("chat", &envelope.to_json().unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.0.lock().await.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();

        let received = recorder.0.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "chat");
        assert_eq!(received[0].1, envelope);
    }
}
