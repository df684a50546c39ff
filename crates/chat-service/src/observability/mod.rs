//! Observability for the chat service.
//!
//! # Privacy by Default
//!
//! Async entry points use `#[instrument(skip_all)]` and add only safe fields.
//! Message content is never logged. Metric labels are bounded:
//! - `kind`: 9 values (message kinds)
//! - `outcome` / `result` / `status`: a handful of fixed strings per metric
//! - `channel`: 2 values (chat, notification)
//! - `endpoint`: normalized route templates, never raw paths
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `chat_connections_active` | Gauge | none | Live WebSocket connections on this instance |
//! | `chat_messages_total` | Counter | `kind`, `outcome` | Dispatched messages |
//! | `chat_message_latency_seconds` | Histogram | `kind` | Dispatch latency |
//! | `chat_deliveries_total` | Counter | `result` | Local delivery results |
//! | `chat_broker_publish_total` | Counter | `channel`, `status` | Broker publishes |
//! | `chat_broker_received_total` | Counter | `channel` | Broker messages received |
//! | `chat_mailbox_total` | Counter | `operation` | Mailbox enqueues, drops and drains |
//! | `chat_membership_changes_total` | Counter | `operation` | Room joins and leaves |
//! | `chat_handshake_rejected_total` | Counter | `reason` | Rejected WebSocket upgrades |
//! | `chat_decode_errors_total` | Counter | `source` | Undecodable frames |
//! | `chat_redis_latency_seconds` | Histogram | `operation` | Redis operation latency |
//! | `chat_archive_total` | Counter | `status` | Persistence collaborator calls |
//! | `chat_http_requests_total` | Counter | `method`, `endpoint`, `status_code` | Control API requests |
//! | `chat_http_request_duration_seconds` | Histogram | `method`, `endpoint`, `status_code` | Control API latency |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
