//! Persistence collaborator client.
//!
//! Completed Chat and Notification envelopes are handed to an external
//! persistence service. Archiving runs off the delivery path: a failure is
//! logged and counted, never surfaced to the sender.

use crate::errors::ChatError;
use crate::observability::metrics;
use crate::protocol::Envelope;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// Per-request timeout for the persistence endpoint.
pub const ARCHIVE_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout for the persistence endpoint.
pub const ARCHIVE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempts per envelope.
pub const ARCHIVE_MAX_ATTEMPTS: u32 = 3;

/// Delay before the second attempt; doubles per attempt.
pub const ARCHIVE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Durable store for completed envelopes.
#[async_trait]
pub trait MessageArchive: Send + Sync {
    async fn store(&self, envelope: &Envelope) -> Result<(), ChatError>;
}

/// Archive that discards everything (no persistence endpoint configured).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopArchive;

#[async_trait]
impl MessageArchive for NoopArchive {
    async fn store(&self, _envelope: &Envelope) -> Result<(), ChatError> {
        Ok(())
    }
}

/// One failed POST.
#[derive(Debug)]
struct AttemptError {
    retryable: bool,
    message: String,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// POSTs each envelope as JSON to a fixed URL.
///
/// Transport errors and 5xx responses are retried; 4xx responses are not.
#[derive(Debug, Clone)]
pub struct HttpArchive {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpArchive {
    /// # Errors
    ///
    /// Returns `ChatError::Config` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(ARCHIVE_HTTP_TIMEOUT)
            .connect_timeout(ARCHIVE_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            retry: RetryPolicy::exponential(ARCHIVE_MAX_ATTEMPTS, ARCHIVE_RETRY_DELAY),
        })
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn post_once(&self, envelope: &Envelope) -> Result<(), AttemptError> {
        let response = self
            .client
            .post(&self.url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| AttemptError {
                retryable: true,
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        trace!(target: "chat.archive", body = %body, "Archive error response body");

        Err(AttemptError {
            retryable: status.is_server_error(),
            message: format!("archive returned {status}"),
        })
    }
}

#[async_trait]
impl MessageArchive for HttpArchive {
    #[instrument(skip_all, fields(message_id = %envelope.message_id))]
    async fn store(&self, envelope: &Envelope) -> Result<(), ChatError> {
        self.retry
            .run(
                "archive_store",
                |e: &AttemptError| e.retryable,
                || self.post_once(envelope),
            )
            .await
            .map_err(|e| ChatError::Archive(e.message))
    }
}

/// Archive `envelope` in the background.
pub fn spawn_archive(archive: &Arc<dyn MessageArchive>, envelope: Envelope) {
    let archive = Arc::clone(archive);
    tokio::spawn(async move {
        match archive.store(&envelope).await {
            Ok(()) => {
                metrics::record_archive("success");
                debug!(target: "chat.archive", message_id = %envelope.message_id, "Archived");
            }
            Err(e) => {
                metrics::record_archive("error");
                warn!(
                    target: "chat.archive",
                    message_id = %envelope.message_id,
                    error = %e,
                    "Failed to archive envelope"
                );
            }
        }
    });
}
