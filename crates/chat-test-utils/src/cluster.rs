//! Multi-instance harness.
//!
//! `TestCluster` runs several `DeliveryService` instances in one process.
//! They share a `LocalBroker` and an `InMemoryStore`, the same way real
//! instances share one Redis server. Each instance has its own registry, its
//! own subscriber task and its own registry listener.

use crate::fixtures::{test_settings, user};
use chat_service::archive::NoopArchive;
use chat_service::delivery::DeliveryService;
use chat_service::fanout::{run_subscriber, Broker, FanoutPublisher, InboundHandler, LocalBroker};
use chat_service::observability::HealthState;
use chat_service::registry::{Connection, ConnectionRegistry};
use chat_service::store::{InMemoryStore, Stores};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long `next_frame` waits before failing the test.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

const READY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestInstance {
    pub service: Arc<DeliveryService>,
    pub health: Arc<HealthState>,
    subscriber: JoinHandle<()>,
    listener: JoinHandle<()>,
}

pub struct TestCluster {
    pub broker: Arc<LocalBroker>,
    pub store: Arc<InMemoryStore>,
    instances: Vec<TestInstance>,
    cancel_token: CancellationToken,
}

impl TestCluster {
    /// Start `size` instances and wait until every subscriber is ready.
    pub async fn start(size: usize) -> Self {
        let broker = Arc::new(LocalBroker::new());
        let store = Arc::new(InMemoryStore::new(100, Duration::from_secs(3600)));
        Self::start_with(size, broker, store).await
    }

    pub async fn start_with(
        size: usize,
        broker: Arc<LocalBroker>,
        store: Arc<InMemoryStore>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let mut instances = Vec::with_capacity(size);

        for index in 0..size {
            let settings = test_settings(&format!("chat-test-{index}"));
            let channels = settings.channels();
            let service = Arc::new(DeliveryService::new(
                settings,
                Arc::new(ConnectionRegistry::new(Duration::from_secs(1))),
                Stores::shared(Arc::clone(&store)),
                FanoutPublisher::new(
                    Arc::clone(&broker) as Arc<dyn Broker>,
                    Duration::from_secs(1),
                    1,
                ),
                Arc::new(NoopArchive),
            ));
            let health = Arc::new(HealthState::new());
            let subscriber = tokio::spawn(run_subscriber(
                Arc::clone(&broker) as Arc<dyn Broker>,
                channels,
                Arc::clone(&service) as Arc<dyn InboundHandler>,
                Arc::clone(&health),
                cancel_token.child_token(),
            ));
            let listener = service.spawn_registry_listener(cancel_token.child_token());
            instances.push(TestInstance {
                service,
                health,
                subscriber,
                listener,
            });
        }

        let cluster = Self {
            broker,
            store,
            instances,
            cancel_token,
        };
        cluster.wait_ready().await;
        cluster
    }

    async fn wait_ready(&self) {
        tokio::time::timeout(READY_TIMEOUT, async {
            while !self.instances.iter().all(|i| i.health.is_ready()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscribers did not become ready");
    }

    pub fn instance(&self, index: usize) -> &Arc<DeliveryService> {
        &self
            .instances
            .get(index)
            .expect("instance index out of range")
            .service
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Connect `user_id` to instance `index`.
    pub async fn connect(&self, index: usize, user_id: &str) -> TestClient {
        TestClient::connect(self.instance(index), user_id).await
    }

    /// Stop every subscriber and registry listener.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        for instance in std::mem::take(&mut self.instances) {
            let _ = instance.subscriber.await;
            let _ = instance.listener.await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// A registered connection and the frames written to it.
pub struct TestClient {
    pub connection: Arc<Connection>,
    frames: mpsc::Receiver<Arc<str>>,
}

impl TestClient {
    pub async fn connect(service: &DeliveryService, user_id: &str) -> Self {
        let (connection, frames) = Connection::new(user(user_id), 64, CancellationToken::new());
        service.connect(Arc::clone(&connection)).await;
        Self { connection, frames }
    }

    /// Wait for the next frame, failing after [`FRAME_TIMEOUT`].
    pub async fn next_frame(&mut self) -> Value {
        let frame = tokio::time::timeout(FRAME_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection queue closed");
        serde_json::from_str(&frame).expect("frame is JSON")
    }

    /// Consume the `CONNECTED` acknowledgement.
    pub async fn expect_ack(&mut self) -> Value {
        let ack = self.next_frame().await;
        assert_eq!(ack["kind"], "SYSTEM", "expected ack, got {ack}");
        assert_eq!(ack["code"], "CONNECTED", "expected ack, got {ack}");
        ack
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(wait, self.frames.recv()).await {
            panic!("unexpected frame: {frame}");
        }
    }

    /// Close the frame queue so the next write to this connection fails,
    /// as if the socket writer died.
    pub fn break_transport(&mut self) {
        self.frames.close();
    }

    /// Frames already queued, without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(serde_json::from_str(&frame).expect("frame is JSON"));
        }
        frames
    }
}
