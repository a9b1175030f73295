//! Billing runtime configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Tunables for the lifecycle engine, independent of the payment provider
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Total attempts for a single provider call (first try included)
    pub provider_max_attempts: usize,
    /// Base delay for provider retry backoff
    pub provider_retry_base_ms: u64,
    /// Extra attempts for a whole unit of work after a persistence conflict
    pub unit_of_work_retries: usize,
    /// Upper bound for a single background notification send
    pub notification_timeout: Duration,
    /// Allowed clock skew between webhook signature timestamp and now
    pub webhook_tolerance_secs: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            provider_max_attempts: 3,
            provider_retry_base_ms: 100,
            unit_of_work_retries: 2,
            notification_timeout: Duration::from_secs(15),
            webhook_tolerance_secs: 300,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            provider_max_attempts: env_parse(
                "BILLING_PROVIDER_MAX_ATTEMPTS",
                defaults.provider_max_attempts,
            )?
            .max(1),
            provider_retry_base_ms: env_parse(
                "BILLING_PROVIDER_RETRY_BASE_MS",
                defaults.provider_retry_base_ms,
            )?,
            unit_of_work_retries: env_parse("BILLING_UOW_RETRIES", defaults.unit_of_work_retries)?,
            notification_timeout: Duration::from_secs(env_parse(
                "BILLING_NOTIFICATION_TIMEOUT_SECS",
                defaults.notification_timeout.as_secs(),
            )?),
            webhook_tolerance_secs: env_parse(
                "BILLING_WEBHOOK_TOLERANCE_SECS",
                defaults.webhook_tolerance_secs,
            )?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(default),
    }
}
