//! Redis pub/sub broker.
//!
//! Publishing goes through the shared multiplexed connection. Each
//! subscription opens a dedicated pub/sub connection whose message stream
//! is forwarded into a bounded channel by a background task.

use super::{Broker, BrokerMessage, SUBSCRIPTION_BUFFER};
use crate::errors::ChatError;
use crate::observability::metrics;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisBroker {
    /// Open the client and the publishing connection.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Broker` if the URL is invalid or the connection
    /// fails.
    pub async fn connect(redis_url: &str) -> Result<Self, ChatError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may contain credentials
            error!(target: "chat.fanout.redis", error = %e, "Failed to open Redis client");
            ChatError::Broker(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "chat.fanout.redis", error = %e, "Failed to connect to Redis");
                ChatError::Broker(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { client, connection })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ChatError> {
        let mut conn = self.connection.clone();
        let start = Instant::now();
        let result: redis::RedisResult<i64> = conn.publish(channel, payload).await;
        metrics::record_redis_latency("publish", start.elapsed());

        let receivers = result.map_err(|e| {
            if e.is_connection_refusal() {
                ChatError::BrokerUnreachable(format!("PUBLISH not sent: {e}"))
            } else {
                ChatError::Broker(format!("PUBLISH failed: {e}"))
            }
        })?;
        debug!(
            target: "chat.fanout.redis",
            channel = %channel,
            receivers = receivers,
            "Published"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<mpsc::Receiver<BrokerMessage>, ChatError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ChatError::Broker(format!("Failed to open pub/sub connection: {e}")))?;

        for channel in channels {
            pubsub.subscribe(channel.as_str()).await.map_err(|e| {
                ChatError::Broker(format!("SUBSCRIBE {channel} failed: {e}"))
            })?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        metrics::record_decode_error("broker");
                        warn!(target: "chat.fanout.redis", error = %e, "Non-text pub/sub payload");
                        continue;
                    }
                };
                let message = BrokerMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            warn!(target: "chat.fanout.redis", "Pub/sub stream ended");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisBroker::connect("definitely not a url").await;
        assert!(matches!(result, Err(ChatError::Broker(_))));
    }
}
