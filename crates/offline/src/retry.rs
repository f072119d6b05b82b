//! Retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Classifies a failure as worth retrying.
///
/// Implementations must return `false` for anything the server decided
/// (validation, conflicts): retrying those can only hide them.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    /// Total number of attempts, the first one included.
    pub retries: u32,
    /// Delay after the first failed attempt; doubles after each further one.
    pub backoff: Duration,
    /// Cap applied to the computed delay.
    pub max_backoff: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryOptions {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self {
            retries,
            backoff,
            ..Default::default()
        }
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Attempts actually made; zero is treated as a single attempt.
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed):
    /// `backoff * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// attempts are used up. Fails with the last error.
pub async fn retry<T, E, F, Fut>(operation: F, options: RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    retry_if(operation, options, |err: &E| err.is_retryable()).await
}

/// Like [`retry`], with a caller-supplied `should_retry` predicate.
pub async fn retry_if<T, E, F, Fut, P>(
    mut operation: F,
    options: RetryOptions,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: Display,
{
    let attempts = options.attempts();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !should_retry(&err) {
                    tracing::debug!(attempt, error = %err, "non-retryable failure");
                    return Err(err);
                }
                if attempt >= attempts {
                    tracing::warn!(attempts, error = %err, "retries exhausted");
                    return Err(err);
                }

                let delay = options.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "attempt failed, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
