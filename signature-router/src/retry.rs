//! Retry with exponential backoff and jitter
//!
//! Attempts against one provider are strictly sequential. Permanent provider
//! errors end the loop early.

use crate::provider::ProviderError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Backoff settings. Attempt counts come from the provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for any delay
    pub max_delay_ms: u64,
    /// Growth per retry
    pub backoff_multiplier: f64,
    /// Relative jitter, 0.2 = ±20%
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result
    pub result: Result<T, ProviderError>,
    /// Calls made, first call included
    pub attempts: u32,
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    /// Create strategy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let base_delay = self.config.base_delay_ms as f64
            * self.config.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Run `operation` up to `max_attempts` times. It receives the 1-based attempt number.
    pub async fn execute<F, Fut, T>(
        &self,
        max_attempts: u32,
        operation_name: &str,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}/{}", operation_name, attempt, max_attempts);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) if !e.is_retryable() => {
                    warn!("Non-retryable error for {}: {}", operation_name, e);
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                Err(e) if attempt >= max_attempts => {
                    warn!("{} failed after {} attempts: {}", operation_name, attempt, e);
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    let delay = self.calculate_delay(attempt - 1);
                    warn!(
                        "Attempt {}/{} failed for {}: {}, retrying in {:?}",
                        attempt, max_attempts, operation_name, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_exponential_backoff() {
        let strategy = no_jitter();
        assert_eq!(strategy.calculate_delay(0).as_millis(), 100);
        assert_eq!(strategy.calculate_delay(1).as_millis(), 200);
        assert_eq!(strategy.calculate_delay(2).as_millis(), 400);
        assert_eq!(strategy.calculate_delay(10).as_millis(), 1_000);
    }

    #[test]
    fn test_jitter_bounds() {
        let strategy = RetryStrategy::new(RetryConfig::default());
        for _ in 0..100 {
            let ms = strategy.calculate_delay(0).as_millis();
            assert!((80..=120).contains(&ms), "{}", ms);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let outcome = no_jitter()
            .execute(3, "send", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::Transport("reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(outcome.result, Ok(2));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = no_jitter()
            .execute(2, "send", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Timeout { ms: 50 }) }
            })
            .await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(outcome.result.unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = no_jitter()
            .execute(5, "send", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::Rejected {
                        code: "INVALID_DESTINATION".into(),
                        message: "no such number".into(),
                    })
                }
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
