//! Subscription lifecycle management
//!
//! Every write to a subscription row runs inside one store transaction that
//! holds the row lock across the provider call, and the whole unit of work is
//! retried when the store reports a concurrent modification. The provider is
//! the source of truth: local status only moves along the allowed transitions,
//! and a disallowed move reported by the provider is logged and skipped.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};
use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, EventBus};
use crate::guard;
use crate::notifications::{BillingNotification, NotificationQueue};
use crate::plans::{Plan, PlanService};
use crate::proration::{ceil_positive_days_until, estimate_proration};
use crate::provider::{
    CreateScheduleParams, CreateSubscriptionParams, InvoiceListFilter, PaymentBehavior,
    PaymentProvider, ProrationMode, ProviderSubscription, UpdateSubscriptionParams,
};
use crate::refund::{RefundOutcome, RefundService};
use crate::retry::RetryPolicy;
use crate::store::{BillingStore, StoreTx};

/// Open invoices settled per resume attempt
const RESUME_INVOICE_LIMIT: u64 = 25;

// ============================================================================
// Status and record
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a raw provider status. Statuses we do not model (e.g. `paused`)
    /// count as incomplete; `incomplete_expired` is a cancellation.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "unpaid" => SubscriptionStatus::Unpaid,
            "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Incomplete,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;

        match (self, next) {
            (from, to) if from == to => true,
            (Canceled, _) => false,
            (_, Canceled) => true,
            (Incomplete, Active | Trialing) => true,
            (Trialing, Active | PastDue) => true,
            (Active, PastDue) => true,
            (PastDue, Active | Unpaid) => true,
            (Unpaid, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(BillingError::Internal(format!(
                "Unknown subscription status: {}",
                other
            ))),
        }
    }
}

/// Local mirror of a workspace's provider subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub plan_id: Uuid,
    pub provider_subscription_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Apply `next` if the lifecycle allows it. Returns whether the status changed.
    fn transition_to(&mut self, next: SubscriptionStatus) -> bool {
        if self.status == next {
            return false;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                workspace_id = %self.workspace_id,
                subscription_id = %self.provider_subscription_id,
                from = %self.status,
                to = %next,
                "Ignoring disallowed subscription status transition"
            );
            return false;
        }
        self.status = next;
        true
    }
}

/// A status write together with the status it replaced
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub record: SubscriptionRecord,
    pub previous: SubscriptionStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.record.status
    }
}

/// Result of finalizing a cancellation
#[derive(Debug, Clone)]
pub struct FinalizedCancellation {
    pub change: StatusChange,
    /// `None` when no refund was attempted or the attempt failed
    pub refund: Option<RefundOutcome>,
}

/// Row lookup inside a unit of work
#[derive(Debug, Clone, Copy)]
enum RowKey<'a> {
    Workspace(Uuid),
    Provider(&'a str),
}

async fn lock_row(
    tx: &mut Box<dyn StoreTx>,
    key: RowKey<'_>,
) -> BillingResult<Option<SubscriptionRecord>> {
    match key {
        RowKey::Workspace(workspace_id) => tx.subscription_for_update(workspace_id).await,
        RowKey::Provider(id) => tx.subscription_by_provider_id_for_update(id).await,
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse `YYYY-MM-DDTHH:MM:SSZ` (any RFC 3339) or `YYYY-MM-DD` (midnight UTC)
pub fn parse_effective_date(raw: &str) -> BillingResult<OffsetDateTime> {
    if let Ok(at) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(at.to_offset(UtcOffset::UTC));
    }
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map(|date| date.midnight().assume_utc())
        .map_err(|_| BillingError::InvalidEffectiveDate(raw.to_string()))
}

/// Start of the calendar month (UTC) containing `now`
pub fn month_start(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    let first = now.date() - Duration::days(i64::from(now.day()) - 1);
    first.midnight().assume_utc()
}

pub(crate) fn subscription_metadata(workspace_id: Uuid, plan_id: Uuid) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("workspace_id".to_string(), workspace_id.to_string());
    metadata.insert("plan_id".to_string(), plan_id.to_string());
    metadata
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct SubscriptionService {
    pub(crate) store: Arc<dyn BillingStore>,
    pub(crate) provider: Arc<dyn PaymentProvider>,
    pub(crate) plans: PlanService,
    pub(crate) customers: CustomerService,
    pub(crate) refunds: RefundService,
    pub(crate) retry: RetryPolicy,
    pub(crate) unit_of_work_retries: usize,
    pub(crate) notifications: NotificationQueue,
    pub(crate) events: EventBus,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        plans: PlanService,
        customers: CustomerService,
        refunds: RefundService,
        retry: RetryPolicy,
        unit_of_work_retries: usize,
        notifications: NotificationQueue,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            provider,
            plans,
            customers,
            refunds,
            retry,
            unit_of_work_retries,
            notifications,
            events,
        }
    }

    /// Re-run `attempt` while it fails with `ConcurrentModification`, up to
    /// `unit_of_work_retries` extra times
    pub(crate) async fn with_unit_of_work<T, F, Fut>(
        &self,
        operation: &str,
        mut attempt: F,
    ) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let mut retries_left = self.unit_of_work_retries;
        loop {
            match attempt().await {
                Err(BillingError::ConcurrentModification) if retries_left > 0 => {
                    retries_left -= 1;
                    tracing::warn!(
                        operation = %operation,
                        retries_left,
                        "Concurrent modification, retrying unit of work"
                    );
                }
                result => return result,
            }
        }
    }

    pub(crate) fn publish_change(&self, change: &StatusChange) {
        if change.changed() {
            self.events.publish(BillingEvent::SubscriptionStatusChanged {
                workspace_id: change.record.workspace_id,
                from: change.previous,
                to: change.record.status,
            });
        }
    }

    pub async fn get_subscription(&self, workspace_id: Uuid) -> BillingResult<SubscriptionRecord> {
        self.store
            .get_subscription(workspace_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(workspace_id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Create / change plan
    // ------------------------------------------------------------------------

    /// Put the workspace on `plan`. Creates a provider subscription when there
    /// is none (or the previous one was canceled), reprices the existing one
    /// otherwise, and does nothing when already active on `plan`.
    pub async fn create_or_update(
        &self,
        workspace_id: Uuid,
        plan: &Plan,
    ) -> BillingResult<SubscriptionRecord> {
        let price_id = plan.require_price_id()?;
        let customer = self.customers.ensure_customer(workspace_id, None).await?;

        let (record, created) = self
            .with_unit_of_work("subscription.create_or_update", || {
                self.create_or_update_once(
                    workspace_id,
                    plan,
                    price_id,
                    &customer.provider_customer_id,
                )
            })
            .await?;

        if created {
            self.notifications.submit(
                workspace_id,
                BillingNotification::Welcome {
                    plan_name: plan.name.clone(),
                },
            );
        }
        Ok(record)
    }

    async fn create_or_update_once(
        &self,
        workspace_id: Uuid,
        plan: &Plan,
        price_id: &str,
        customer_id: &str,
    ) -> BillingResult<(SubscriptionRecord, bool)> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.store.begin().await?;
        let existing = tx.subscription_for_update(workspace_id).await?;

        if let Some(current) = existing
            .as_ref()
            .filter(|s| s.status != SubscriptionStatus::Canceled)
        {
            if current.plan_id == plan.id && current.status == SubscriptionStatus::Active {
                tracing::debug!(
                    workspace_id = %workspace_id,
                    plan_id = %plan.id,
                    "Subscription already active on requested plan"
                );
                return Ok((current.clone(), false));
            }

            let updated = self.change_plan(current, plan, price_id, now).await?;
            tx.update_subscription(&updated).await?;
            tx.commit().await?;

            self.publish_change(&StatusChange {
                previous: current.status,
                record: updated.clone(),
            });
            tracing::info!(
                workspace_id = %workspace_id,
                subscription_id = %updated.provider_subscription_id,
                plan_id = %plan.id,
                status = %updated.status,
                "Updated subscription plan"
            );
            return Ok((updated, false));
        }

        let params = CreateSubscriptionParams {
            customer_id: customer_id.to_string(),
            price_id: price_id.to_string(),
            payment_behavior: if plan.is_free() {
                PaymentBehavior::AllowIncomplete
            } else {
                PaymentBehavior::DefaultIncomplete
            },
            proration_behavior: None,
            trial_end: None,
            metadata: subscription_metadata(workspace_id, plan.id),
        };
        let key = format!("sub_create_{}_{}", workspace_id, plan.id);
        let created = self
            .retry
            .run("subscription.create", || {
                self.provider.create_subscription(&params, Some(&key))
            })
            .await?;

        let status = SubscriptionStatus::from_provider(&created.status);
        let record = self
            .store_new_lifecycle(&mut tx, existing, workspace_id, plan.id, &created, status, now)
            .await?;
        tx.commit().await?;

        tracing::info!(
            workspace_id = %workspace_id,
            subscription_id = %record.provider_subscription_id,
            plan_id = %plan.id,
            status = %record.status,
            "Created subscription"
        );
        Ok((record, true))
    }

    /// Write a row for a freshly created provider subscription, reusing a
    /// canceled row when there is one. This starts a new lifecycle, so the
    /// status is set rather than transitioned.
    pub(crate) async fn store_new_lifecycle(
        &self,
        tx: &mut Box<dyn StoreTx>,
        previous: Option<SubscriptionRecord>,
        workspace_id: Uuid,
        plan_id: Uuid,
        created: &ProviderSubscription,
        status: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        match previous {
            Some(old) => {
                let record = SubscriptionRecord {
                    plan_id,
                    provider_subscription_id: created.id.clone(),
                    status,
                    current_period_end: Some(created.current_period_end),
                    created_at: now,
                    updated_at: now,
                    ..old
                };
                tx.update_subscription(&record).await?;
                Ok(record)
            }
            None => {
                let record = SubscriptionRecord {
                    id: Uuid::new_v4(),
                    workspace_id,
                    plan_id,
                    provider_subscription_id: created.id.clone(),
                    status,
                    current_period_end: Some(created.current_period_end),
                    created_at: now,
                    updated_at: now,
                };
                tx.insert_subscription(&record).await?;
                Ok(record)
            }
        }
    }

    /// Reprice the provider subscription, guarding downgrades of active plans
    async fn change_plan(
        &self,
        current: &SubscriptionRecord,
        plan: &Plan,
        price_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        if current.status == SubscriptionStatus::Active {
            if let Some(current_plan) = self.store.get_plan(current.plan_id).await? {
                if plan.price < current_plan.price {
                    let usage = self
                        .store
                        .usage_counts(current.workspace_id, month_start(now))
                        .await?;
                    guard::check_downgrade(&current_plan, plan, &usage)?;
                }
            }
        }

        let provider_sub_id = current.provider_subscription_id.as_str();
        let existing = self
            .retry
            .run("subscription.get", || {
                self.provider.get_subscription(provider_sub_id)
            })
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(current.workspace_id.to_string()))?;

        let params = UpdateSubscriptionParams {
            item_id: existing.item_id,
            price_id: Some(price_id.to_string()),
            proration_behavior: Some(ProrationMode::CreateProrations),
            metadata: Some(subscription_metadata(current.workspace_id, plan.id)),
            ..Default::default()
        };
        let key = format!("sub_update_{}_{}", provider_sub_id, plan.id);
        let updated = self
            .retry
            .run("subscription.update", || {
                self.provider
                    .update_subscription(provider_sub_id, &params, Some(&key))
            })
            .await?;

        let mut record = current.clone();
        record.plan_id = plan.id;
        record.transition_to(SubscriptionStatus::from_provider(&updated.status));
        record.current_period_end = Some(updated.current_period_end);
        record.updated_at = now;
        Ok(record)
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    /// Cancel now without invoicing or prorating. The local row is canceled
    /// even when the provider call fails; the refund follows from the
    /// provider's deletion event.
    pub async fn cancel_immediately(&self, workspace_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record = self.get_subscription(workspace_id).await?;
        if record.status == SubscriptionStatus::Canceled {
            return Ok(record);
        }

        let provider_sub_id = record.provider_subscription_id.as_str();
        let key = format!("cancel_{}", provider_sub_id);
        if let Err(e) = self
            .retry
            .run("subscription.cancel", || {
                self.provider.cancel_subscription(provider_sub_id, Some(&key))
            })
            .await
        {
            tracing::error!(
                workspace_id = %workspace_id,
                subscription_id = %provider_sub_id,
                error = %e,
                "Failed to cancel provider subscription, canceling locally"
            );
        }

        let change = self
            .with_unit_of_work("subscription.cancel", || {
                self.write_status_once(
                    RowKey::Workspace(workspace_id),
                    SubscriptionStatus::Canceled,
                    None,
                )
            })
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(workspace_id.to_string()))?;

        if change.changed() {
            self.publish_change(&change);
            self.notifications
                .submit(workspace_id, BillingNotification::SubscriptionCanceled);
            tracing::info!(
                workspace_id = %workspace_id,
                subscription_id = %provider_sub_id,
                "Canceled subscription"
            );
        }
        Ok(change.record)
    }

    /// Refund the unused part of the period, make sure the provider
    /// subscription is gone, and cancel the local row. Refund and provider
    /// failures are logged; only the local write can fail the call.
    pub async fn refund_and_finalize_cancellation(
        &self,
        provider_subscription_id: &str,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<FinalizedCancellation>> {
        let Some(record) = self
            .store
            .get_subscription_by_provider_id(provider_subscription_id)
            .await?
        else {
            tracing::warn!(
                subscription_id = %provider_subscription_id,
                "No local subscription for canceled provider subscription"
            );
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        let refund = match (period_start, period_end) {
            (Some(start), Some(end)) => {
                match self.refunds.refund_unused_period(&record, start, end, now).await {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        tracing::error!(
                            workspace_id = %record.workspace_id,
                            subscription_id = %provider_subscription_id,
                            error = %e,
                            "Prorated refund failed"
                        );
                        None
                    }
                }
            }
            _ => {
                tracing::info!(
                    subscription_id = %provider_subscription_id,
                    "Skipping refund calculation: missing period bounds"
                );
                None
            }
        };

        let key = format!("cancel_{}", provider_subscription_id);
        match self
            .retry
            .run("subscription.cancel", || {
                self.provider
                    .cancel_subscription(provider_subscription_id, Some(&key))
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_provider_not_found() => tracing::debug!(
                subscription_id = %provider_subscription_id,
                "Provider subscription already gone"
            ),
            Err(e) => tracing::warn!(
                subscription_id = %provider_subscription_id,
                error = %e,
                "Provider cancel failed during finalization"
            ),
        }

        let change = self
            .with_unit_of_work("subscription.finalize_cancellation", || {
                self.write_status_once(
                    RowKey::Provider(provider_subscription_id),
                    SubscriptionStatus::Canceled,
                    None,
                )
            })
            .await?;

        Ok(change.map(|change| {
            self.publish_change(&change);
            FinalizedCancellation { change, refund }
        }))
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    async fn write_status_once(
        &self,
        key: RowKey<'_>,
        next: SubscriptionStatus,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<StatusChange>> {
        let mut tx = self.store.begin().await?;
        let Some(mut record) = lock_row(&mut tx, key).await? else {
            return Ok(None);
        };

        let previous = record.status;
        record.transition_to(next);
        if let Some(end) = period_end {
            record.current_period_end = Some(end);
        }
        record.updated_at = OffsetDateTime::now_utc();

        tx.update_subscription(&record).await?;
        tx.commit().await?;
        Ok(Some(StatusChange { record, previous }))
    }

    /// Reconcile the local row with a status reported by the provider
    pub async fn sync_status(
        &self,
        provider_subscription_id: &str,
        provider_status: &str,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<StatusChange>> {
        let next = SubscriptionStatus::from_provider(provider_status);
        let change = self
            .with_unit_of_work("subscription.sync_status", || {
                self.write_status_once(RowKey::Provider(provider_subscription_id), next, period_end)
            })
            .await?;

        match &change {
            Some(change) => {
                self.publish_change(change);
                tracing::info!(
                    workspace_id = %change.record.workspace_id,
                    subscription_id = %provider_subscription_id,
                    provider_status = %provider_status,
                    status = %change.record.status,
                    "Synced subscription status"
                );
            }
            None => tracing::warn!(
                subscription_id = %provider_subscription_id,
                "Subscription not found for provider id"
            ),
        }
        Ok(change)
    }

    pub async fn mark_active(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<StatusChange>> {
        self.sync_status(provider_subscription_id, "active", None).await
    }

    pub async fn mark_past_due(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<StatusChange>> {
        self.sync_status(provider_subscription_id, "past_due", None).await
    }

    // ------------------------------------------------------------------------
    // Resume
    // ------------------------------------------------------------------------

    /// Settle outstanding invoices, then bring the subscription back: recreate
    /// it when the provider no longer has it, otherwise reactivate in place
    pub async fn resume_if_no_due(&self, workspace_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record = self.get_subscription(workspace_id).await?;
        if record.status == SubscriptionStatus::Active {
            tracing::info!(workspace_id = %workspace_id, "Subscription already active");
            return Ok(record);
        }

        let customer = self.customers.ensure_customer(workspace_id, None).await?;
        let provider_sub_id = record.provider_subscription_id.as_str();

        let provider_sub = self
            .retry
            .run("subscription.get", || {
                self.provider.get_subscription(provider_sub_id)
            })
            .await?;
        if provider_sub.is_none() {
            tracing::warn!(
                workspace_id = %workspace_id,
                subscription_id = %provider_sub_id,
                "Provider subscription not found, will recreate"
            );
        }

        let failures = self
            .settle_outstanding_invoices(&customer.provider_customer_id)
            .await?;
        if !failures.is_empty() {
            return Err(BillingError::OutstandingInvoices(failures));
        }

        let plan = self.plans.get_plan(record.plan_id).await?;

        let provider_sub = match provider_sub {
            Some(sub) if !sub.is_canceled() => sub,
            _ => {
                // Close the old lifecycle so the row is reused for the new subscription
                if let Some(change) = self
                    .with_unit_of_work("subscription.resume", || {
                        self.write_status_once(
                            RowKey::Workspace(workspace_id),
                            SubscriptionStatus::Canceled,
                            None,
                        )
                    })
                    .await?
                {
                    self.publish_change(&change);
                }
                tracing::info!(workspace_id = %workspace_id, "Recreating provider subscription");
                return self.create_or_update(workspace_id, &plan).await;
            }
        };

        if provider_sub.status != "active" {
            let params = UpdateSubscriptionParams {
                payment_behavior: Some(PaymentBehavior::AllowIncomplete),
                proration_behavior: Some(ProrationMode::None),
                ..Default::default()
            };
            self.retry
                .run("subscription.update", || {
                    self.provider
                        .update_subscription(provider_sub_id, &params, None)
                })
                .await?;
        }

        let refreshed = self
            .retry
            .run("subscription.get", || {
                self.provider.get_subscription(provider_sub_id)
            })
            .await?;

        if let Some(refreshed) = refreshed {
            self.sync_status(
                provider_sub_id,
                &refreshed.status,
                Some(refreshed.current_period_end),
            )
            .await?;
        }

        let resumed = self.get_subscription(workspace_id).await?;
        tracing::info!(
            workspace_id = %workspace_id,
            status = %resumed.status,
            "Subscription resume completed"
        );
        Ok(resumed)
    }

    /// Finalize drafts and pay open invoices. Returns one message per failure.
    async fn settle_outstanding_invoices(&self, customer_id: &str) -> BillingResult<Vec<String>> {
        let mut failures = Vec::new();

        for status in ["draft", "open"] {
            let filter = InvoiceListFilter {
                customer_id: Some(customer_id.to_string()),
                status: Some(status.to_string()),
                limit: RESUME_INVOICE_LIMIT,
                ..Default::default()
            };
            let page = self
                .retry
                .run("invoice.list", || self.provider.list_invoices(&filter))
                .await?;

            for invoice in page.invoices {
                let invoice_id = invoice.id.as_str();
                if invoice.status.as_deref() == Some("draft") {
                    let finalize_key = format!("finalize_invoice_{}", invoice_id);
                    if let Err(e) = self
                        .retry
                        .run("invoice.finalize", || {
                            self.provider
                                .finalize_invoice(invoice_id, Some(&finalize_key))
                        })
                        .await
                    {
                        tracing::error!(invoice_id = %invoice_id, error = %e, "Failed to finalize invoice");
                        failures.push(format!("{}: {}", invoice_id, e));
                        continue;
                    }
                }

                let pay_key = format!("pay_invoice_{}", invoice_id);
                match self
                    .retry
                    .run("invoice.pay", || {
                        self.provider.pay_invoice(invoice_id, Some(&pay_key))
                    })
                    .await
                {
                    Ok(_) => tracing::info!(invoice_id = %invoice_id, "Invoice paid"),
                    Err(e) => {
                        tracing::error!(invoice_id = %invoice_id, error = %e, "Failed to pay invoice");
                        failures.push(format!("{}: {}", invoice_id, e));
                    }
                }
            }
        }

        Ok(failures)
    }

    // ------------------------------------------------------------------------
    // Scheduling and estimates
    // ------------------------------------------------------------------------

    /// Schedule a move to `plan` at `effective_date`. An empty proration mode
    /// leaves the provider default. Returns the schedule id.
    pub async fn schedule_change(
        &self,
        workspace_id: Uuid,
        plan: &Plan,
        effective_date: &str,
        proration_mode: &str,
    ) -> BillingResult<String> {
        let proration = match proration_mode {
            "" => None,
            mode => Some(mode.parse::<ProrationMode>()?),
        };
        let start_date = parse_effective_date(effective_date)?;

        let record = self.get_subscription(workspace_id).await?;
        let plan = self.plans.ensure_plan_synced(plan).await?;
        let price_id = plan.require_price_id()?;

        let params = CreateScheduleParams {
            from_subscription: record.provider_subscription_id.clone(),
            start_date,
            price_id: price_id.to_string(),
            proration_behavior: proration,
        };
        let key = format!(
            "schedule_{}_{}_{}",
            record.provider_subscription_id,
            plan.id,
            start_date.unix_timestamp()
        );
        let schedule_id = self
            .retry
            .run("subscription_schedule.create", || {
                self.provider.create_subscription_schedule(&params, Some(&key))
            })
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            schedule_id = %schedule_id,
            plan_id = %plan.id,
            effective_date = %effective_date,
            "Scheduled subscription change"
        );
        Ok(schedule_id)
    }

    /// Display-only cost estimate of switching to `new_plan_descriptor`, in
    /// minor units. Negative for downgrades.
    pub async fn estimate_proration(
        &self,
        workspace_id: Uuid,
        new_plan_descriptor: &str,
    ) -> BillingResult<i64> {
        let record = self.get_subscription(workspace_id).await?;
        let current_plan = self.plans.get_plan(record.plan_id).await?;
        let new_plan = self.plans.get_plan_by_descriptor(new_plan_descriptor).await?;

        let days_remaining = record
            .current_period_end
            .map(|end| ceil_positive_days_until(end, OffsetDateTime::now_utc()))
            .unwrap_or(0);

        Ok(estimate_proration(
            current_plan.price,
            new_plan.price,
            days_remaining,
        ))
    }
}
