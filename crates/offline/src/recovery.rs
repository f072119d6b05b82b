//! "Try network, then retry, then fallback, then default" decision chain.
//!
//! Only retryable failures (transport, 5xx) move down the chain. A rejection
//! returns immediately with neither fallback nor default, whatever the caller
//! supplied.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::network::NetworkStatusMonitor;
use crate::retry::{RetryOptions, Retryable};

const ERROR_HISTORY: usize = 100;

/// Aggregate counters since construction (or the last [`RecoveryOrchestrator::reset_stats`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub retry_count: u64,
    pub fallback_used: u64,
    pub cache_used: u64,
    pub success_rate: f64,
}

impl RecoveryStats {
    fn recompute_rate(&mut self) {
        self.success_rate = if self.total_recoveries == 0 {
            0.0
        } else {
            self.successful_recoveries as f64 / self.total_recoveries as f64
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub context: Option<String>,
    pub message: String,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Second-chance operation run once after the network path gave up.
pub struct Fallback<'a, T, E> {
    future: BoxFuture<'a, Result<T, E>>,
    from_cache: bool,
}

/// Per-call recovery settings.
pub struct RecoveryOptions<'a, T, E> {
    pub max_retries: u32,
    pub retry_delay: Duration,
    fallback: Option<Fallback<'a, T, E>>,
    default_value: Option<T>,
    context: Option<String>,
}

impl<'a, T, E> RecoveryOptions<'a, T, E> {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            fallback: None,
            default_value: None,
            context: None,
        }
    }

    pub fn from_retry(options: RetryOptions) -> Self {
        Self::new(options.retries, options.backoff)
    }

    pub fn with_fallback(mut self, fallback: impl Future<Output = Result<T, E>> + Send + 'a) -> Self {
        self.fallback = Some(Fallback {
            future: Box::pin(fallback),
            from_cache: false,
        });
        self
    }

    /// Fallback that reads the local cache; counted in `cache_used`.
    pub fn with_cache_fallback(
        mut self,
        fallback: impl Future<Output = Result<T, E>> + Send + 'a,
    ) -> Self {
        self.fallback = Some(Fallback {
            future: Box::pin(fallback),
            from_cache: true,
        });
        self
    }

    /// Opt into masking a transient failure with `value`.
    pub fn with_default(mut self, value: T) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    fn retry_options(&self) -> RetryOptions {
        RetryOptions::new(self.max_retries, self.retry_delay)
    }
}

/// Result of one [`RecoveryOrchestrator::auto_recover`] call.
#[derive(Debug)]
pub struct RecoveryOutcome<T, E> {
    value: Result<T, E>,
    pub retry_count: u32,
    pub used_fallback: bool,
    pub used_default: bool,
    /// The monitor reported `OFFLINE`, so the network path was not attempted.
    pub network_skipped: bool,
}

impl<T, E: Display> RecoveryOutcome<T, E> {
    pub fn success(&self) -> bool {
        self.value.is_ok()
    }

    pub fn result(&self) -> Result<&T, &E> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&E> {
        self.value.as_ref().err()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error().map(ToString::to_string)
    }

    pub fn into_result(self) -> Result<T, E> {
        self.value
    }
}

/// Runs operations through the recovery chain and keeps the statistics.
///
/// Constructed explicitly and shared by reference; tests build their own.
#[derive(Default)]
pub struct RecoveryOrchestrator {
    stats: Mutex<RecoveryStats>,
    errors: Mutex<VecDeque<ErrorRecord>>,
    monitor: Option<Arc<dyn NetworkStatusMonitor>>,
}

impl RecoveryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the network path while `monitor` reports `OFFLINE` and a fallback
    /// or default is available.
    pub fn with_monitor(mut self, monitor: Arc<dyn NetworkStatusMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Most recent failures, oldest first.
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = RecoveryStats::default();
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn is_offline(&self) -> bool {
        self.monitor
            .as_ref()
            .is_some_and(|m| !m.status().state.is_usable())
    }

    pub async fn auto_recover<'a, T, E, F, Fut>(
        &self,
        mut operation: F,
        options: RecoveryOptions<'a, T, E>,
    ) -> RecoveryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let retry = options.retry_options();
        let RecoveryOptions {
            fallback,
            default_value,
            context,
            ..
        } = options;

        let offline = self.is_offline();
        let network_skipped = offline && (fallback.is_some() || default_value.is_some());
        // Offline with nothing to fall back on: one attempt so the caller gets
        // the real error.
        let attempts = if offline { 1 } else { retry.attempts() };

        let mut progress = Progress {
            network_skipped,
            ..Progress::default()
        };

        let mut last_error = None;
        if network_skipped {
            tracing::debug!(
                context = context.as_deref().unwrap_or("-"),
                "offline; skipping network attempt"
            );
        } else {
            let mut attempt = 1;
            loop {
                match operation().await {
                    Ok(value) => return self.finish(progress.into_outcome(Ok(value)), &context),
                    Err(err) if !err.is_retryable() => {
                        tracing::warn!(
                            context = context.as_deref().unwrap_or("-"),
                            error = %err,
                            "operation rejected; not recovering"
                        );
                        return self.finish(progress.into_outcome(Err(err)), &context);
                    }
                    Err(err) if attempt >= attempts => {
                        tracing::warn!(attempts, error = %err, "network attempts exhausted");
                        last_error = Some(err);
                        break;
                    }
                    Err(err) => {
                        let delay = retry.delay_for_attempt(attempt);
                        tracing::debug!(attempt, ?delay, error = %err, "retrying after failure");
                        tokio::time::sleep(delay).await;
                        progress.retry_count += 1;
                        attempt += 1;
                    }
                }
            }
        }

        if let Some(fallback) = fallback {
            progress.used_fallback = true;
            self.count(|s| {
                s.fallback_used += 1;
                if fallback.from_cache {
                    s.cache_used += 1;
                }
            });
            match fallback.future.await {
                Ok(value) => return self.finish(progress.into_outcome(Ok(value)), &context),
                Err(err) => {
                    tracing::warn!(error = %err, "fallback failed");
                    last_error = Some(err);
                }
            }
        }

        if let Some(value) = default_value {
            if let Some(err) = &last_error {
                self.record_error(&context, err);
            }
            progress.used_default = true;
            return self.finish(progress.into_outcome(Ok(value)), &context);
        }

        let value = match last_error {
            Some(err) => Err(err),
            // Nothing left to serve from: the network gets its one attempt.
            None => operation().await,
        };
        self.finish(progress.into_outcome(value), &context)
    }

    fn finish<T, E: Display>(
        &self,
        outcome: RecoveryOutcome<T, E>,
        context: &Option<String>,
    ) -> RecoveryOutcome<T, E> {
        if let Err(err) = &outcome.value {
            self.record_error(context, err);
        }
        let success = outcome.success();
        let retries = u64::from(outcome.retry_count);
        self.count(|s| {
            s.total_recoveries += 1;
            if success {
                s.successful_recoveries += 1;
            } else {
                s.failed_recoveries += 1;
            }
            s.retry_count += retries;
        });
        outcome
    }

    fn count(&self, f: impl FnOnce(&mut RecoveryStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
        stats.recompute_rate();
    }

    fn record_error(&self, context: &Option<String>, err: &impl Display) {
        let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        if errors.len() == ERROR_HISTORY {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord {
            at: Utc::now(),
            context: context.clone(),
            message: err.to_string(),
        });
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    retry_count: u32,
    used_fallback: bool,
    used_default: bool,
    network_skipped: bool,
}

impl Progress {
    fn into_outcome<T, E>(self, value: Result<T, E>) -> RecoveryOutcome<T, E> {
        RecoveryOutcome {
            value,
            retry_count: self.retry_count,
            used_fallback: self.used_fallback,
            used_default: self.used_default,
            network_skipped: self.network_skipped,
        }
    }
}
