//! Retry backoff curves and the transient-fault retry decorator.

use std::future::Future;
use std::time::Duration;

use crate::error::QueueError;
use crate::events::{EventSink, QueueEvent};

/// Backoff curve for failed job attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(300_000),
        }
    }
}

impl RetryConfig {
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }
}

/// Delay before retrying the given attempt (1-based, the just-failed one):
/// `clamp(initial * multiplier^(attempt - 1), 0, max)`.
pub fn backoff_delay(attempt: i32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).max(0);
    let millis = config.initial_delay.as_millis() as f64 * config.multiplier.powi(exponent);
    let capped = millis.min(config.max_delay.as_millis() as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Retry policy for individual state-adapter calls.
#[derive(Debug, Clone)]
pub struct AdapterRetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for AdapterRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }
}

/// Run `f`, retrying transient failures with geometric delay.
///
/// Only [`QueueError::is_transient`] faults are retried. When retries are
/// exhausted the last error is surfaced and a `StateAdapterError` event is
/// emitted with the operation name.
pub async fn with_retries<T, F, Fut>(
    operation: &'static str,
    policy: &AdapterRetryPolicy,
    events: &dyn EventSink,
    f: F,
) -> Result<T, QueueError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying transient state adapter failure"
                );
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(policy.multiplier);
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    events.emit(QueueEvent::StateAdapterError {
                        operation: operation.to_string(),
                        detail: err.to_string(),
                    });
                }
                return Err(err);
            }
        }
    }
}
