//! Provider customers and payment methods

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;
use crate::provider::{CardInfo, PaymentMethodInfo, PaymentProvider, SetupIntentInfo};
use crate::retry::RetryPolicy;
use crate::store::{BillingCustomer, BillingStore};
use crate::subscriptions::SubscriptionRecord;

/// Cards expiring within this many days are flagged
const EXPIRING_SOON_DAYS: i64 = 30;

/// Default card summary shown on the billing page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp_month: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp_year: Option<i64>,
    pub expired: bool,
    pub expiring_soon: bool,
    pub days_until_expiry: i64,
}

impl PaymentMethodSummary {
    pub fn from_card(id: &str, card: &CardInfo, now: OffsetDateTime) -> Self {
        let days = days_until_card_expiry(card.exp_year, card.exp_month, now);
        let expired = days < 0;
        Self {
            id: Some(id.to_string()),
            brand: Some(card.brand.clone()),
            last4: Some(card.last4.clone()),
            exp_month: Some(card.exp_month),
            exp_year: Some(card.exp_year),
            expired,
            expiring_soon: !expired && days <= EXPIRING_SOON_DAYS,
            days_until_expiry: days,
        }
    }
}

/// Whole days until the last day of the card's expiry month, negative once past
fn days_until_card_expiry(exp_year: i64, exp_month: i64, now: OffsetDateTime) -> i64 {
    let month = u8::try_from(exp_month)
        .ok()
        .and_then(|m| Month::try_from(m).ok());
    let year = i32::try_from(exp_year).ok();

    let (Some(year), Some(month)) = (year, month) else {
        return -1;
    };
    let Ok(first) = Date::from_calendar_date(year, month, 1) else {
        return -1;
    };
    let last_day = first.replace_day(time::util::days_in_year_month(year, month));
    let Ok(last_day) = last_day else {
        return -1;
    };

    (last_day.midnight().assume_utc() - now).whole_days()
}

/// `pm_` followed by one or more ASCII letters or digits
pub fn is_payment_method_id(id: &str) -> bool {
    id.strip_prefix("pm_")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub payment_method: PaymentMethodSummary,
}

#[derive(Clone)]
pub struct CustomerService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    retry: RetryPolicy,
}

impl CustomerService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            retry,
        }
    }

    /// Stored customer mapping for the workspace, created on first use
    pub async fn ensure_customer(
        &self,
        workspace_id: Uuid,
        email: Option<&str>,
    ) -> BillingResult<BillingCustomer> {
        if let Some(existing) = self.store.get_customer(workspace_id).await? {
            return Ok(existing);
        }

        let mut metadata = HashMap::new();
        metadata.insert("workspace_id".to_string(), workspace_id.to_string());
        let key = format!("customer_{}", workspace_id);

        let created = self
            .retry
            .run("customer.create", || {
                self.provider
                    .create_customer(email, metadata.clone(), Some(&key))
            })
            .await?;

        let customer = self.store.insert_customer(workspace_id, &created.id).await?;
        if customer.provider_customer_id != created.id {
            tracing::warn!(
                workspace_id = %workspace_id,
                stored_customer_id = %customer.provider_customer_id,
                created_customer_id = %created.id,
                "Workspace already had a customer mapping, keeping the stored one"
            );
        } else {
            tracing::info!(
                workspace_id = %workspace_id,
                customer_id = %created.id,
                "Created payment provider customer"
            );
        }
        Ok(customer)
    }

    /// Attach a card to the workspace's customer and make it the default
    pub async fn attach_payment_method(
        &self,
        workspace_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<PaymentMethodSummary> {
        if !is_payment_method_id(payment_method_id) {
            return Err(BillingError::InvalidPaymentMethod(format!(
                "malformed payment method id: {}",
                payment_method_id
            )));
        }

        let customer = self.ensure_customer(workspace_id, None).await?;
        let customer_id = customer.provider_customer_id.as_str();

        let method = self
            .retry
            .run("payment_method.get", || {
                self.provider.get_payment_method(payment_method_id)
            })
            .await
            .map_err(|e| {
                if e.is_provider_not_found() {
                    BillingError::InvalidPaymentMethod(format!(
                        "payment method not found: {}",
                        payment_method_id
                    ))
                } else {
                    e
                }
            })?;

        let card = validate_card(&method)?.clone();

        let attach_key = format!("attach_pm_{}_{}", payment_method_id, customer_id);
        self.retry
            .run("payment_method.attach", || {
                self.provider
                    .attach_payment_method(payment_method_id, customer_id, Some(&attach_key))
            })
            .await?;

        let default_key = format!("set_default_pm_{}_{}", payment_method_id, customer_id);
        self.retry
            .run("customer.set_default_payment_method", || {
                self.provider
                    .set_default_payment_method(customer_id, payment_method_id, Some(&default_key))
            })
            .await?;

        self.store
            .set_default_payment_method(workspace_id, Some(payment_method_id))
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Attached default payment method"
        );

        Ok(PaymentMethodSummary::from_card(
            payment_method_id,
            &card,
            OffsetDateTime::now_utc(),
        ))
    }

    /// Setup intent for collecting a card off-session
    pub async fn create_setup_intent(&self, workspace_id: Uuid) -> BillingResult<SetupIntentInfo> {
        let customer = self.ensure_customer(workspace_id, None).await?;
        let mut metadata = HashMap::new();
        metadata.insert("workspace_id".to_string(), workspace_id.to_string());
        let key = format!(
            "setup_intent_{}_{}",
            workspace_id,
            OffsetDateTime::now_utc().unix_timestamp()
        );

        let intent = self
            .retry
            .run("setup_intent.create", || {
                self.provider.create_setup_intent(
                    &customer.provider_customer_id,
                    metadata.clone(),
                    Some(&key),
                )
            })
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            setup_intent_id = %intent.id,
            "Created setup intent"
        );
        Ok(intent)
    }

    /// Self-service portal URL
    pub async fn create_portal_session(
        &self,
        workspace_id: Uuid,
        return_url: &str,
    ) -> BillingResult<String> {
        if return_url.trim().is_empty() {
            return Err(BillingError::InvalidInput("returnUrl is required".into()));
        }
        let customer = self.ensure_customer(workspace_id, None).await?;
        let url = self
            .retry
            .run("portal_session.create", || {
                self.provider
                    .create_portal_session(&customer.provider_customer_id, return_url)
            })
            .await?;

        tracing::info!(workspace_id = %workspace_id, "Created billing portal session");
        Ok(url)
    }

    /// Subscription, plan, and default card for the billing page.
    ///
    /// Card lookup failures degrade to an empty summary.
    pub async fn subscription_details(&self, workspace_id: Uuid) -> BillingResult<SubscriptionDetails> {
        let subscription = self.store.get_subscription(workspace_id).await?;
        let plan = match &subscription {
            Some(sub) => self.store.get_plan(sub.plan_id).await?,
            None => None,
        };

        let payment_method = self
            .default_card(workspace_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(
                    workspace_id = %workspace_id,
                    error = %e,
                    "Could not load default payment method"
                );
                None
            })
            .unwrap_or_default();

        Ok(SubscriptionDetails {
            subscription,
            plan,
            payment_method,
        })
    }

    async fn default_card(&self, workspace_id: Uuid) -> BillingResult<Option<PaymentMethodSummary>> {
        let customer = self.ensure_customer(workspace_id, None).await?;

        let provider_customer = self
            .retry
            .run("customer.get", || {
                self.provider.get_customer(&customer.provider_customer_id)
            })
            .await?;

        // The provider can lag behind a just-attached card; fall back to ours
        let Some(pm_id) = provider_customer
            .default_payment_method
            .or(customer.default_payment_method_id)
        else {
            return Ok(None);
        };

        let method = self
            .retry
            .run("payment_method.get", || self.provider.get_payment_method(&pm_id))
            .await?;

        Ok(method
            .card
            .as_ref()
            .map(|card| PaymentMethodSummary::from_card(&method.id, card, OffsetDateTime::now_utc())))
    }

    /// Attach the setup intent's payment method and make it the customer's default.
    ///
    /// The checkout session's customer wins over the intent's own.
    pub async fn apply_setup_intent(
        &self,
        setup_intent_id: &str,
        session_customer_id: Option<&str>,
    ) -> BillingResult<Option<String>> {
        let intent = self
            .retry
            .run("setup_intent.get", || {
                self.provider.get_setup_intent(setup_intent_id)
            })
            .await?;

        let customer_id = session_customer_id
            .map(str::to_string)
            .or(intent.customer_id);
        let (Some(customer_id), Some(pm_id)) = (customer_id, intent.payment_method_id) else {
            tracing::warn!(
                setup_intent_id = %setup_intent_id,
                "Setup intent has no customer or payment method"
            );
            return Ok(None);
        };

        let attach_key = format!("attach_pm_{}_{}", pm_id, customer_id);
        self.retry
            .run("payment_method.attach", || {
                self.provider
                    .attach_payment_method(&pm_id, &customer_id, Some(&attach_key))
            })
            .await?;

        let key = format!("set_default_pm_{}_{}", pm_id, customer_id);
        self.retry
            .run("customer.set_default_payment_method", || {
                self.provider
                    .set_default_payment_method(&customer_id, &pm_id, Some(&key))
            })
            .await?;

        match self.store.get_customer_by_provider_id(&customer_id).await? {
            Some(customer) => {
                self.store
                    .set_default_payment_method(customer.workspace_id, Some(&pm_id))
                    .await?;
                tracing::info!(
                    workspace_id = %customer.workspace_id,
                    payment_method_id = %pm_id,
                    "Default payment method set from setup intent"
                );
            }
            None => tracing::warn!(
                customer_id = %customer_id,
                "Setup intent customer is not mapped to a workspace"
            ),
        }

        Ok(Some(pm_id))
    }

    /// The provider replaced a card's details; keep our default pointer in step
    pub async fn refresh_payment_method(&self, method: &PaymentMethodInfo) -> BillingResult<()> {
        let Some(customer_id) = method.customer_id.as_deref() else {
            return Ok(());
        };
        let Some(customer) = self.store.get_customer_by_provider_id(customer_id).await? else {
            return Ok(());
        };

        if customer.default_payment_method_id.as_deref() == Some(method.id.as_str()) {
            self.store
                .set_default_payment_method(customer.workspace_id, Some(&method.id))
                .await?;
            tracing::info!(
                workspace_id = %customer.workspace_id,
                payment_method_id = %method.id,
                "Default payment method automatically updated"
            );
        }
        Ok(())
    }
}

fn validate_card(method: &PaymentMethodInfo) -> BillingResult<&CardInfo> {
    if method.kind != "card" {
        return Err(BillingError::InvalidPaymentMethod(format!(
            "unsupported payment method type: {}",
            method.kind
        )));
    }
    method
        .card
        .as_ref()
        .filter(|card| !card.last4.is_empty() && card.exp_month != 0 && card.exp_year != 0)
        .ok_or_else(|| {
            BillingError::InvalidPaymentMethod(
                "payment method does not have valid card details".into(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn card(exp_month: i64, exp_year: i64) -> CardInfo {
        CardInfo {
            brand: "visa".into(),
            last4: "4242".into(),
            exp_month,
            exp_year,
        }
    }

    #[test]
    fn payment_method_id_format() {
        assert!(is_payment_method_id("pm_1NxYz2AbC"));
        assert!(!is_payment_method_id("pm_"));
        assert!(!is_payment_method_id("card_123"));
        assert!(!is_payment_method_id("pm_12-34"));
        assert!(!is_payment_method_id(""));
    }

    #[test]
    fn card_expiring_this_month_is_flagged() {
        let now = datetime!(2025-06-10 12:00 UTC);
        let summary = PaymentMethodSummary::from_card("pm_1", &card(6, 2025), now);
        assert!(!summary.expired);
        assert!(summary.expiring_soon);
        assert_eq!(summary.days_until_expiry, 19);
    }

    #[test]
    fn card_from_last_year_is_expired() {
        let now = datetime!(2025-06-10 12:00 UTC);
        let summary = PaymentMethodSummary::from_card("pm_1", &card(3, 2024), now);
        assert!(summary.expired);
        assert!(!summary.expiring_soon);
    }

    #[test]
    fn distant_expiry_is_not_flagged() {
        let now = datetime!(2025-06-10 12:00 UTC);
        let summary = PaymentMethodSummary::from_card("pm_1", &card(12, 2030), now);
        assert!(!summary.expired && !summary.expiring_soon);
    }

    #[test]
    fn non_card_methods_are_rejected() {
        let method = PaymentMethodInfo {
            id: "pm_1".into(),
            kind: "sepa_debit".into(),
            customer_id: None,
            card: None,
        };
        assert!(matches!(
            validate_card(&method),
            Err(BillingError::InvalidPaymentMethod(_))
        ));
    }
}
