//! Trials and grace periods

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;
use crate::proration::ceil_positive_days_until;
use crate::provider::{
    CreateSubscriptionParams, PaymentBehavior, ProrationMode, ProviderSubscription,
    UpdateSubscriptionParams,
};
use crate::subscriptions::{
    subscription_metadata, SubscriptionRecord, SubscriptionService, SubscriptionStatus,
};

const MAX_TRIAL_DAYS: i64 = 730;
const MAX_EXTENSION_DAYS: i64 = 30;
const MAX_GRACE_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialInfo {
    pub is_in_trial: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    pub days_remaining: i64,
}

impl TrialInfo {
    fn from_provider(sub: &ProviderSubscription, now: OffsetDateTime) -> Self {
        let is_in_trial = sub.status == "trialing";
        let days_remaining = match (is_in_trial, sub.trial_end) {
            (true, Some(end)) => ceil_positive_days_until(end, now),
            _ => 0,
        };
        Self {
            is_in_trial,
            trial_end: sub.trial_end,
            days_remaining,
        }
    }

    fn none() -> Self {
        Self {
            is_in_trial: false,
            trial_end: None,
            days_remaining: 0,
        }
    }
}

fn check_days(field: &str, days: i64, max: i64) -> BillingResult<()> {
    if (1..=max).contains(&days) {
        Ok(())
    } else {
        Err(BillingError::InvalidInput(format!(
            "{} must be between 1 and {}",
            field, max
        )))
    }
}

impl SubscriptionService {
    /// Start a trial on `plan`. A workspace with a live subscription cannot
    /// start a trial; a canceled one starts a fresh lifecycle.
    pub async fn create_trial(
        &self,
        workspace_id: Uuid,
        plan: &Plan,
        trial_days: i64,
    ) -> BillingResult<SubscriptionRecord> {
        check_days("trialDays", trial_days, MAX_TRIAL_DAYS)?;
        let price_id = plan.require_price_id()?;
        let customer = self.customers.ensure_customer(workspace_id, None).await?;

        self.with_unit_of_work("subscription.create_trial", || async {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.store.begin().await?;
            let existing = tx.subscription_for_update(workspace_id).await?;
            if existing
                .as_ref()
                .is_some_and(|s| s.status != SubscriptionStatus::Canceled)
            {
                return Err(BillingError::InvalidInput(
                    "Workspace already has a subscription".to_string(),
                ));
            }

            let mut metadata = subscription_metadata(workspace_id, plan.id);
            metadata.insert("trial".to_string(), "true".to_string());
            let params = CreateSubscriptionParams {
                customer_id: customer.provider_customer_id.clone(),
                price_id: price_id.to_string(),
                payment_behavior: PaymentBehavior::DefaultIncomplete,
                proration_behavior: Some(ProrationMode::None),
                trial_end: Some(now + Duration::days(trial_days)),
                metadata,
            };
            let key = format!("trial_{}_{}", workspace_id, plan.id);
            let created = self
                .retry
                .run("subscription.create", || {
                    self.provider.create_subscription(&params, Some(&key))
                })
                .await?;

            let record = self
                .store_new_lifecycle(
                    &mut tx,
                    existing,
                    workspace_id,
                    plan.id,
                    &created,
                    SubscriptionStatus::Trialing,
                    now,
                )
                .await?;
            tx.commit().await?;

            tracing::info!(
                workspace_id = %workspace_id,
                subscription_id = %record.provider_subscription_id,
                plan_id = %plan.id,
                trial_days,
                "Created trial subscription"
            );
            Ok(record)
        })
        .await
    }

    /// Push the provider trial end out by `additional_days`
    pub async fn extend_trial(
        &self,
        workspace_id: Uuid,
        additional_days: i64,
    ) -> BillingResult<TrialInfo> {
        check_days("additionalDays", additional_days, MAX_EXTENSION_DAYS)?;
        let (record, current) = self.provider_subscription_for(workspace_id).await?;
        if current.status != "trialing" {
            return Err(BillingError::SubscriptionNotInTrial);
        }

        let now = OffsetDateTime::now_utc();
        let new_end = current.trial_end.unwrap_or(now) + Duration::days(additional_days);
        let params = UpdateSubscriptionParams {
            trial_end: Some(new_end),
            proration_behavior: Some(ProrationMode::None),
            ..Default::default()
        };
        let provider_sub_id = record.provider_subscription_id.as_str();
        let key = format!("trial_extend_{}_{}", provider_sub_id, new_end.unix_timestamp());
        let updated = self
            .retry
            .run("subscription.update", || {
                self.provider
                    .update_subscription(provider_sub_id, &params, Some(&key))
            })
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            subscription_id = %provider_sub_id,
            additional_days,
            "Extended trial period"
        );
        Ok(TrialInfo::from_provider(&updated, now))
    }

    /// Give a past-due subscription `grace_days` before enforcement. Returns
    /// the end of the grace period.
    pub async fn handle_grace_period(
        &self,
        workspace_id: Uuid,
        grace_days: i64,
    ) -> BillingResult<OffsetDateTime> {
        check_days("graceDays", grace_days, MAX_GRACE_DAYS)?;
        let (record, current) = self.provider_subscription_for(workspace_id).await?;
        if current.status != "past_due" {
            return Err(BillingError::SubscriptionNotPastDue);
        }

        let grace_end = OffsetDateTime::now_utc() + Duration::days(grace_days);
        let formatted = grace_end
            .format(&Rfc3339)
            .map_err(|e| BillingError::Internal(format!("Failed to format grace end: {}", e)))?;

        let mut metadata = subscription_metadata(workspace_id, record.plan_id);
        metadata.insert("grace_period_end".to_string(), formatted);
        let params = UpdateSubscriptionParams {
            metadata: Some(metadata),
            ..Default::default()
        };
        let provider_sub_id = record.provider_subscription_id.as_str();
        let key = format!("grace_{}_{}", provider_sub_id, grace_end.unix_timestamp());
        self.retry
            .run("subscription.update", || {
                self.provider
                    .update_subscription(provider_sub_id, &params, Some(&key))
            })
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            subscription_id = %provider_sub_id,
            grace_days,
            "Granted grace period"
        );
        Ok(grace_end)
    }

    pub async fn check_trial_status(&self, workspace_id: Uuid) -> BillingResult<TrialInfo> {
        let record = self.get_subscription(workspace_id).await?;
        let provider_sub_id = record.provider_subscription_id.as_str();
        let current = self
            .retry
            .run("subscription.get", || {
                self.provider.get_subscription(provider_sub_id)
            })
            .await?;

        Ok(current
            .map(|sub| TrialInfo::from_provider(&sub, OffsetDateTime::now_utc()))
            .unwrap_or_else(TrialInfo::none))
    }

    /// Trialing subscriptions whose trial ends within `days`
    pub async fn trials_ending_within(
        &self,
        days: i64,
    ) -> BillingResult<Vec<(SubscriptionRecord, TrialInfo)>> {
        let mut ending = Vec::new();
        for record in self
            .store
            .list_subscriptions_by_status(SubscriptionStatus::Trialing)
            .await?
        {
            match self.check_trial_status(record.workspace_id).await {
                Ok(info) if info.is_in_trial && info.days_remaining <= days => {
                    ending.push((record, info))
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    workspace_id = %record.workspace_id,
                    error = %e,
                    "Failed to check trial status"
                ),
            }
        }
        Ok(ending)
    }

    async fn provider_subscription_for(
        &self,
        workspace_id: Uuid,
    ) -> BillingResult<(SubscriptionRecord, ProviderSubscription)> {
        let record = self.get_subscription(workspace_id).await?;
        let provider_sub_id = record.provider_subscription_id.as_str();
        let current = self
            .retry
            .run("subscription.get", || {
                self.provider.get_subscription(provider_sub_id)
            })
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(workspace_id.to_string()))?;
        Ok((record, current))
    }
}
