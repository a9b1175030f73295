//! Hosted checkout sessions

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;
use crate::provider::{CheckoutMode, CreateCheckoutParams, PaymentProvider};
use crate::retry::RetryPolicy;
use crate::subscriptions::subscription_metadata;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    provider: Arc<dyn PaymentProvider>,
    customers: CustomerService,
    retry: RetryPolicy,
}

impl CheckoutService {
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

    /// Start a hosted checkout for `plan`. Free plans only collect a card
    /// (setup mode); paid plans start the subscription directly.
    pub async fn create_checkout_session(
        &self,
        workspace_id: Uuid,
        plan: &Plan,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSession> {
        if success_url.is_empty() || cancel_url.is_empty() {
            return Err(BillingError::InvalidInput(
                "successUrl and cancelUrl are required".to_string(),
            ));
        }
        let price_id = plan.require_price_id()?;
        let customer = self.customers.ensure_customer(workspace_id, None).await?;

        let (mode, price_id) = if plan.is_free() {
            (CheckoutMode::Setup, None)
        } else {
            (CheckoutMode::Subscription, Some(price_id.to_string()))
        };
        let params = CreateCheckoutParams {
            customer_id: customer.provider_customer_id.clone(),
            mode,
            price_id,
            success_url: success_url.to_string(),
            cancel_url: cancel_url.to_string(),
            metadata: subscription_metadata(workspace_id, plan.id),
        };

        let session = self
            .retry
            .run("checkout_session.create", || {
                self.provider.create_checkout_session(&params, None)
            })
            .await?;
        let url = session.url.ok_or_else(|| {
            BillingError::Internal(format!("Checkout session {} has no URL", session.id))
        })?;

        tracing::info!(
            workspace_id = %workspace_id,
            plan_id = %plan.id,
            session_id = %session.id,
            mode = mode.as_str(),
            "Created checkout session"
        );

        Ok(CheckoutSession {
            session_id: session.id,
            url,
        })
    }
}
