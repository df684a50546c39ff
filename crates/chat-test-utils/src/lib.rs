//! # Chat Test Utilities
//!
//! Shared test utilities for the chat gateway.
//!
//! ## Modules
//!
//! - `fixtures` - identities, envelopes and signed user tokens
//! - `mock_broker` - brokers that fail on purpose
//! - `cluster` - several delivery instances sharing one broker and store
//! - `server_harness` - a real HTTP/WebSocket server on a random port
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chat_test_utils::cluster::TestCluster;
//! use chat_test_utils::fixtures::user;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let cluster = TestCluster::start(2).await;
//!     let mut bob = cluster.connect(1, "bob").await;
//!     bob.expect_ack().await;
//!
//!     cluster
//!         .instance(0)
//!         .send_private_message(user("alice"), user("bob"), "hi".into())
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(bob.next_frame().await["content"], "hi");
//! }
//! ```

pub mod cluster;
pub mod fixtures;
pub mod mock_broker;
pub mod server_harness;

pub use cluster::{TestClient, TestCluster};
pub use fixtures::*;
pub use mock_broker::FailingBroker;
pub use server_harness::TestChatServer;
