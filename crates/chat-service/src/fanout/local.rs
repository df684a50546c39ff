//! In-process broker for single-node mode and tests.
//!
//! Every subscriber sees every publish, exactly like Redis pub/sub between
//! instances sharing one server.

use super::{Broker, BrokerMessage, SUBSCRIPTION_BUFFER};
use crate::errors::ChatError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

const BROADCAST_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct LocalBroker {
    sender: broadcast::Sender<BrokerMessage>,
    published: AtomicUsize,
}

impl LocalBroker {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            published: AtomicUsize::new(0),
        }
    }

    /// Total publishes accepted since creation.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ChatError> {
        self.published.fetch_add(1, Ordering::SeqCst);
        // no subscribers is not an error
        let _ = self.sender.send(BrokerMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<mpsc::Receiver<BrokerMessage>, ChatError> {
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channels = channels.to_vec();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if !channels.contains(&message.channel) {
                            continue;
                        }
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "chat.fanout.local", skipped = skipped, "Subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_publish() {
        let broker = LocalBroker::new();
        let mut first = broker.subscribe(&["chat".to_string()]).await.unwrap();
        let mut second = broker
            .subscribe(&["chat".to_string(), "notification".to_string()])
            .await
            .unwrap();

        broker.publish("notification", "n1").await.unwrap();
        broker.publish("chat", "c1").await.unwrap();

        assert_eq!(first.recv().await.unwrap().payload, "c1");
        assert_eq!(second.recv().await.unwrap().payload, "n1");
        assert_eq!(second.recv().await.unwrap().payload, "c1");
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let broker = LocalBroker::new();
        assert!(broker.publish("chat", "nobody listening").await.is_ok());
    }
}
