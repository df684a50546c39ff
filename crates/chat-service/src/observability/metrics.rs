//! Metrics definitions for the chat service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `chat_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

const FAST_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
];

const HTTP_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
];

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("chat_message".to_string()),
            FAST_BUCKETS,
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .set_buckets_for_metric(Matcher::Prefix("chat_redis".to_string()), FAST_BUCKETS)
        .map_err(|e| format!("Failed to set Redis latency buckets: {e}"))?
        .set_buckets_for_metric(Matcher::Prefix("chat_http".to_string()), HTTP_BUCKETS)
        .map_err(|e| format!("Failed to set HTTP duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Set the number of live WebSocket connections on this instance.
///
/// Metric: `chat_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("chat_connections_active").set(count as f64);
}

/// Record a dispatched message.
///
/// Metric: `chat_messages_total`
/// Labels: `kind`, `outcome` (`dispatched`, `rejected`, `failed`)
pub fn record_message(kind: &'static str, outcome: &'static str) {
    counter!("chat_messages_total", "kind" => kind, "outcome" => outcome).increment(1);
}

/// Record dispatch latency for one message.
///
/// Metric: `chat_message_latency_seconds`
/// Labels: `kind`
pub fn record_message_latency(kind: &'static str, duration: Duration) {
    histogram!("chat_message_latency_seconds", "kind" => kind).record(duration.as_secs_f64());
}

/// Record a local delivery attempt.
///
/// Metric: `chat_deliveries_total`
/// Labels: `result` (`delivered`, `not_local`, `transport_error`)
pub fn record_delivery(result: &'static str) {
    counter!("chat_deliveries_total", "result" => result).increment(1);
}

/// Record a broker publish.
///
/// Metric: `chat_broker_publish_total`
/// Labels: `channel`, `status` (`success`, `error`, `timeout`)
pub fn record_broker_publish(channel: &str, status: &'static str) {
    counter!("chat_broker_publish_total", "channel" => channel.to_string(), "status" => status)
        .increment(1);
}

/// Record a message received from the broker.
///
/// Metric: `chat_broker_received_total`
/// Labels: `channel`
pub fn record_broker_received(channel: &str) {
    counter!("chat_broker_received_total", "channel" => channel.to_string()).increment(1);
}

/// Record mailbox activity.
///
/// Metric: `chat_mailbox_total`
/// Labels: `operation` (`enqueued`, `dropped`, `drained`, `failed`)
pub fn record_mailbox(operation: &'static str, count: u64) {
    counter!("chat_mailbox_total", "operation" => operation).increment(count);
}

/// Record a membership change.
///
/// Metric: `chat_membership_changes_total`
/// Labels: `operation` (`join`, `leave`)
pub fn record_membership(operation: &'static str) {
    counter!("chat_membership_changes_total", "operation" => operation).increment(1);
}

/// Record a rejected WebSocket handshake.
///
/// Metric: `chat_handshake_rejected_total`
/// Labels: `reason` (`missing_identity`, `invalid_identity`)
pub fn record_handshake_rejected(reason: &'static str) {
    counter!("chat_handshake_rejected_total", "reason" => reason).increment(1);
}

/// Record a frame that failed to decode.
///
/// Metric: `chat_decode_errors_total`
/// Labels: `source` (`client`, `broker`, `mailbox`)
pub fn record_decode_error(source: &'static str) {
    counter!("chat_decode_errors_total", "source" => source).increment(1);
}

/// Record Redis operation latency.
///
/// Metric: `chat_redis_latency_seconds`
/// Labels: `operation`
pub fn record_redis_latency(operation: &'static str, duration: Duration) {
    histogram!("chat_redis_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record a persistence collaborator call.
///
/// Metric: `chat_archive_total`
/// Labels: `status` (`success`, `error`)
pub fn record_archive(status: &'static str) {
    counter!("chat_archive_total", "status" => status).increment(1);
}

/// Record a control API request.
///
/// Metrics: `chat_http_requests_total`, `chat_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status_code`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let method = method.to_string();
    let endpoint = endpoint.to_string();
    let status_code = status_code.to_string();

    histogram!(
        "chat_http_request_duration_seconds",
        "method" => method.clone(),
        "endpoint" => endpoint.clone(),
        "status_code" => status_code.clone()
    )
    .record(duration.as_secs_f64());

    counter!(
        "chat_http_requests_total",
        "method" => method,
        "endpoint" => endpoint,
        "status_code" => status_code
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These execute the recording functions against the global no-op
    // recorder; values are not asserted.

    #[test]
    fn test_gauges() {
        set_connections_active(0);
        set_connections_active(10_000);
    }

    #[test]
    fn test_counters() {
        record_message("CHAT", "dispatched");
        record_message("TYPING", "rejected");
        record_delivery("delivered");
        record_delivery("not_local");
        record_broker_publish("chat", "success");
        record_broker_publish("notification", "timeout");
        record_broker_received("chat");
        record_mailbox("enqueued", 1);
        record_mailbox("dropped", 3);
        record_membership("join");
        record_handshake_rejected("missing_identity");
        record_decode_error("client");
        record_archive("error");
    }

    #[test]
    fn test_histograms() {
        record_message_latency("CHAT", Duration::from_millis(3));
        record_redis_latency("sadd", Duration::from_micros(400));
        record_http_request("GET", "/api/v1/presence/online-count", 200, Duration::from_millis(2));
    }
}
