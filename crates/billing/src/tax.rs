//! Tax calculation
//!
//! Thin layer over the provider's tax API. A calculation covers a single
//! service-charge line and resolves the customer's location from their billing
//! address.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::provider::PaymentProvider;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxQuote {
    pub amount_total: i64,
    pub tax_amount_exclusive: i64,
    pub tax_amount_inclusive: i64,
}

/// ISO 4217 code, three ASCII letters
pub fn is_currency_code(currency: &str) -> bool {
    currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic())
}

#[derive(Clone)]
pub struct TaxService {
    provider: Arc<dyn PaymentProvider>,
    customers: CustomerService,
    retry: RetryPolicy,
}

impl TaxService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        customers: CustomerService,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            customers,
            retry,
        }
    }

    pub async fn calculate_tax(
        &self,
        workspace_id: Uuid,
        amount: i64,
        currency: &str,
    ) -> BillingResult<TaxQuote> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "amount must be positive".to_string(),
            ));
        }
        if !is_currency_code(currency) {
            return Err(BillingError::InvalidInput(format!(
                "Invalid currency: {}",
                currency
            )));
        }

        let customer = self.customers.ensure_customer(workspace_id, None).await?;
        let currency = currency.to_ascii_lowercase();
        let calculation = self
            .retry
            .run("tax_calculation.create", || {
                self.provider
                    .calculate_tax(&customer.provider_customer_id, amount, &currency)
            })
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            calculation_id = ?calculation.id,
            amount_total = calculation.amount_total,
            tax_amount_exclusive = calculation.tax_amount_exclusive,
            "Tax calculation completed"
        );

        Ok(TaxQuote {
            amount_total: calculation.amount_total,
            tax_amount_exclusive: calculation.tax_amount_exclusive,
            tax_amount_inclusive: calculation.tax_amount_inclusive,
        })
    }

    /// Account-wide default tax code. Operator use only.
    pub async fn update_tax_settings(&self, default_tax_code: &str) -> BillingResult<()> {
        if !default_tax_code.starts_with("txcd_") {
            return Err(BillingError::InvalidInput(format!(
                "Invalid tax code: {}",
                default_tax_code
            )));
        }

        self.retry
            .run("tax_settings.update", || {
                self.provider.update_tax_settings(default_tax_code)
            })
            .await?;

        tracing::info!(default_tax_code = %default_tax_code, "Tax settings updated");
        Ok(())
    }
}
