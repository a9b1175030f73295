//! Application state

use std::sync::Arc;

use ledgerly_billing::BillingService;
use sqlx::PgPool;

use crate::{
    config::Config,
    error::{ApiError, ApiResult},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// `None` in billing-disabled mode
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        // Try to initialize billing if Stripe env vars are set
        let billing = if config.enable_billing {
            match BillingService::from_env(pool) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self::with_billing(config, billing)
    }

    pub fn with_billing(config: Config, billing: Option<Arc<BillingService>>) -> Self {
        Self { config, billing }
    }

    /// Billing service, or `BillingDisabled` when running without it
    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing.as_deref().ok_or(ApiError::BillingDisabled)
    }
}
