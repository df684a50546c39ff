//! Brokers for failure-path tests.

use async_trait::async_trait;
use chat_service::errors::ChatError;
use chat_service::fanout::{Broker, BrokerMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Rejects every publish and subscribe.
#[derive(Debug, Default)]
pub struct FailingBroker {
    publish_attempts: AtomicUsize,
}

impl FailingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for FailingBroker {
    async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), ChatError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        Err(ChatError::Broker("broker unavailable".to_string()))
    }

    async fn subscribe(
        &self,
        _channels: &[String],
    ) -> Result<mpsc::Receiver<BrokerMessage>, ChatError> {
        Err(ChatError::Broker("broker unavailable".to_string()))
    }
}
