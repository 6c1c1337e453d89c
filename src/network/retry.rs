//! Bounded exponential backoff for transport failures.

use crate::config::TransportConfig;
use crate::error::{Error, Result, TransportError};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry schedule: `initial_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
        )
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error or
    /// the retry budget is spent.
    ///
    /// `attempt` receives the 0-based attempt number. `on_retry` runs before
    /// each backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        endpoint: &str,
        mut attempt: F,
        mut on_retry: impl FnMut(u32, &Error),
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match attempt(retry).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if retry >= self.max_retries => {
                    return Err(TransportError::RetriesExhausted {
                        endpoint: endpoint.to_string(),
                        attempts: retry + 1,
                        last_error: e.to_string(),
                    }
                    .into());
                }
                Err(e) => {
                    let delay = self.delay_for(retry);
                    debug!(
                        endpoint,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transport failure"
                    );
                    on_retry(retry, &e);
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}
