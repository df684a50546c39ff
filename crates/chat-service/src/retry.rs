//! Retry policy for fallible async operations.
//!
//! Used around broker publishes and archive writes. The policy is a plain
//! value: callers wrap the operation in a closure and say which errors are
//! worth retrying.
//!
//! ```rust,ignore
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(50));
//! policy
//!     .run("archive", |e: &ChatError| !matches!(e, ChatError::BadRequest(_)), || {
//!         archive.store(&envelope)
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Cap for any single backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub delay: Duration,
    /// Double the delay after every failed attempt.
    pub exponential: bool,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            exponential: false,
        }
    }

    /// Delay doubling after every failed attempt, capped at
    /// [`MAX_RETRY_DELAY`].
    #[must_use]
    pub fn exponential(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            exponential: true,
        }
    }

    /// Single attempt.
    #[must_use]
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.delay.min(MAX_RETRY_DELAY);
        }
        let shift = attempt.saturating_sub(1).min(16);
        self.delay
            .checked_mul(1u32 << shift)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }

    /// Run `f` until it succeeds, `should_retry` rejects the error, or the
    /// attempts are exhausted. Returns the last error.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        should_retry: impl Fn(&E) -> bool,
        mut f: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts || !should_retry(&e) => {
                    if self.max_attempts > 1 {
                        error!(
                            target: "chat.retry",
                            operation = operation,
                            attempts = attempt,
                            error = %e,
                            "Giving up"
                        );
                    }
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        target: "chat.retry",
                        operation = operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_schedule() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(100));
        assert_eq!(fixed.delay_after(1), Duration::from_millis(100));
        assert_eq!(fixed.delay_after(3), Duration::from_millis(100));

        let exp = RetryPolicy::exponential(5, Duration::from_millis(100));
        assert_eq!(exp.delay_after(1), Duration::from_millis(100));
        assert_eq!(exp.delay_after(2), Duration::from_millis(200));
        assert_eq!(exp.delay_after(3), Duration::from_millis(400));
        assert_eq!(exp.delay_after(40), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10));

        let counter = Arc::clone(&calls);
        let result: Result<&str, String> = policy
            .run("test", |_| true, || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));

        let counter = Arc::clone(&calls);
        let result: Result<(), String> = policy
            .run("test", |_| true, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(5, Duration::from_secs(60));

        let counter = Arc::clone(&calls);
        let result: Result<(), String> = policy
            .run("test", |e: &String| e != "fatal", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
