//! Retry Logic
//!
//! Exponential backoff with jitter for token endpoint calls. Only
//! [`ErrorKind::Transient`](crate::ErrorKind::Transient) failures are retried.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{CredentialError, CredentialResult};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped_delay * self.jitter.clamp(0.0, 1.0);
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Retry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub total_attempts: u32,
    pub successful_retries: u32,
    pub failed_operations: u32,
}

/// Runs token endpoint operations with backoff.
#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    stats: Mutex<RetryStats>,
}

impl RetryExecutor {
    /// Create new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute `operation`, retrying transient failures.
    ///
    /// A provider supplied `retry_after` replaces the computed delay, capped
    /// at `max_delay`.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> CredentialResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CredentialResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            self.record(|stats| stats.total_attempts += 1);

            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        self.record(|stats| stats.successful_retries += 1);
                        tracing::info!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_retryable() || attempt + 1 >= max_attempts {
                        self.record(|stats| stats.failed_operations += 1);
                        return Err(error);
                    }

                    let delay = self.next_delay(&error, attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn next_delay(&self, error: &CredentialError, attempt: u32) -> Duration {
        match error.retry_after() {
            Some(retry_after) => retry_after.min(self.config.max_delay),
            None => self.config.delay_for(attempt),
        }
    }

    fn record(&self, update: impl FnOnce(&mut RetryStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Get retry statistics.
    pub fn get_stats(&self) -> RetryStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
