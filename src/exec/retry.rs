//! Retry with exponential backoff and jitter.
//!
//! Applies to every agent invocation and to reasoning-client calls. Only
//! errors classified retryable by [`AgentError::is_retryable`] are retried;
//! everything else fails the call on the spot.

use crate::types::AgentError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff tuning. `max_retries` is the number of retries after the first
/// attempt, so a call makes at most `max_retries + 1` attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_exponential_base() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            exponential_base: default_exponential_base(),
        }
    }
}

impl RetryConfig {
    /// A copy of this config with a different retry budget.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    /// Backoff delay before retry number `retry` (zero-based), including
    /// uniform jitter in `[0, delay/2]`.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.exponential_base.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..=capped / 2.0);
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Result of a retried call plus how many attempts were made.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, AgentError>,
    pub attempts: u32,
}

/// Run `op` up to `config.max_retries + 1` times, backing off between
/// retryable failures. The closure receives the one-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => {
                if !err.is_retryable() || attempt >= max_attempts {
                    if attempt > 1 {
                        tracing::warn!(
                            target = label,
                            attempts = attempt,
                            error = %err,
                            "retries exhausted"
                        );
                    }
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                let delay = config.delay_before_retry(attempt - 1);
                tracing::debug!(
                    target = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
