//! Bounded retry for individual payment provider calls
//!
//! Wraps one provider request at a time, never a whole multi-step operation.
//! Only transient failures (connection, 429, 5xx) are retried; validation and
//! business-rule rejections surface on the first attempt.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 100)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        Self::new(config.provider_max_attempts, config.provider_retry_base_ms)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `action`, retrying transient provider failures with jittered
    /// exponential backoff until the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, action: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        // base, 2*base, 4*base, ...
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms / 2)
            .max_delay(MAX_BACKOFF)
            .map(jitter)
            .take(self.max_attempts - 1);

        let mut attempt = 0usize;
        let max_attempts = self.max_attempts;
        RetryIf::spawn(strategy, action, |err: &BillingError| {
            attempt += 1;
            let transient = err.is_transient();
            if transient && attempt < max_attempts {
                tracing::warn!(
                    operation = %operation,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %err,
                    "Transient provider error, retrying"
                );
            }
            transient
        })
        .await
    }
}
