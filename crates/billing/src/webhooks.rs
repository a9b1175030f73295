//! Stripe webhook handling
//!
//! Every delivery is verified, deduplicated by event id, dispatched, and only
//! then recorded. A handler error leaves the event unrecorded so the provider's
//! redelivery retries it.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::{
    checkout_session_from_event, invoice_from_event, payment_method_from_event,
    subscription_from_event,
};
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, EventBus};
use crate::invoices::InvoiceService;
use crate::notifications::{BillingNotification, NotificationQueue};
use crate::provider::{PaymentProvider, ProviderEvent};
use crate::retry::RetryPolicy;
use crate::store::{BillingStore, WebhookEventRecord};
use crate::subscriptions::{SubscriptionService, SubscriptionStatus};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";
const MAX_EVENT_PAGE: i64 = 100;

/// Event types with a dedicated handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WebhookEventKind {
    #[serde(rename = "customer.subscription.created")]
    SubscriptionCreated,
    #[serde(rename = "customer.subscription.updated")]
    SubscriptionUpdated,
    #[serde(rename = "customer.subscription.deleted")]
    SubscriptionDeleted,
    #[serde(rename = "customer.subscription.trial_will_end")]
    TrialWillEnd,
    #[serde(rename = "invoice.payment_succeeded")]
    InvoicePaymentSucceeded,
    #[serde(rename = "invoice.payment_failed")]
    InvoicePaymentFailed,
    #[serde(rename = "invoice.finalized")]
    InvoiceFinalized,
    #[serde(rename = "invoice.voided")]
    InvoiceVoided,
    #[serde(rename = "invoice.marked_uncollectible")]
    InvoiceMarkedUncollectible,
    #[serde(rename = "payment_method.automatically_updated")]
    PaymentMethodAutomaticallyUpdated,
    #[serde(rename = "checkout.session.completed")]
    CheckoutSessionCompleted,
    #[serde(rename = "unknown")]
    Unknown,
}

impl WebhookEventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "customer.subscription.trial_will_end" => Self::TrialWillEnd,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "invoice.finalized" => Self::InvoiceFinalized,
            "invoice.voided" => Self::InvoiceVoided,
            "invoice.marked_uncollectible" => Self::InvoiceMarkedUncollectible,
            "payment_method.automatically_updated" => Self::PaymentMethodAutomaticallyUpdated,
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Already recorded; the handler did not run
    Duplicate,
    /// Unhandled event type, accepted and recorded
    Ignored,
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>...]`)
/// against `payload`. Any matching `v1` value is accepted.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    if secret.is_empty() {
        return Err(BillingError::WebhookNotConfigured);
    }

    let mut timestamp: Option<&str> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let Some(raw_ts) = timestamp.filter(|_| !candidates.is_empty()) else {
        tracing::warn!("Malformed webhook signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    };
    let ts: i64 = raw_ts
        .parse()
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;

    if now.abs_diff(ts) > tolerance_secs.unsigned_abs() {
        tracing::warn!(timestamp = ts, now, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(raw_ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    let matched = candidates
        .iter()
        .filter_map(|candidate| hex::decode(candidate).ok())
        .any(|given| bool::from(expected.as_slice().ct_eq(given.as_slice())));

    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    subscriptions: SubscriptionService,
    customers: CustomerService,
    invoices: InvoiceService,
    notifications: NotificationQueue,
    events: EventBus,
    retry: RetryPolicy,
    webhook_secret: Option<String>,
    tolerance_secs: i64,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        subscriptions: SubscriptionService,
        customers: CustomerService,
        invoices: InvoiceService,
        notifications: NotificationQueue,
        events: EventBus,
        retry: RetryPolicy,
        webhook_secret: Option<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            store,
            provider,
            subscriptions,
            customers,
            invoices,
            notifications,
            events,
            retry,
            webhook_secret,
            tolerance_secs,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.webhook_secret.is_some()
    }

    /// Verify, deduplicate, dispatch, and record one delivery
    pub async fn process(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        let Some(secret) = self.webhook_secret.as_deref() else {
            tracing::warn!("Webhook secret not configured, rejecting delivery");
            return Err(BillingError::WebhookNotConfigured);
        };
        verify_signature(
            payload,
            signature,
            secret,
            self.tolerance_secs,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let event: ProviderEvent = serde_json::from_slice(payload)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

        if self.store.webhook_event_exists(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Webhook event already processed"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = self.dispatch(&event).await?;
        self.record(&event).await;
        Ok(outcome)
    }

    /// Fetch an event from the provider and run its handler again, skipping
    /// the duplicate check
    pub async fn replay_event(&self, event_id: &str) -> BillingResult<WebhookOutcome> {
        let event = self
            .retry
            .run("event.retrieve", || self.provider.get_event(event_id))
            .await?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Replaying webhook event"
        );
        let outcome = self.dispatch(&event).await?;
        self.record(&event).await;
        Ok(outcome)
    }

    pub async fn list_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store
            .list_webhook_events(limit.clamp(1, MAX_EVENT_PAGE), offset.max(0))
            .await
    }

    async fn record(&self, event: &ProviderEvent) {
        match self
            .store
            .record_webhook_event(&event.id, &event.event_type)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                event_id = %event.id,
                "Webhook event was recorded concurrently"
            ),
            Err(e) => tracing::warn!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook event"
            ),
        }
    }

    async fn dispatch(&self, event: &ProviderEvent) -> BillingResult<WebhookOutcome> {
        let object = &event.data.object;
        let kind = WebhookEventKind::parse(&event.event_type);

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = match kind {
            WebhookEventKind::SubscriptionCreated | WebhookEventKind::SubscriptionUpdated => {
                self.handle_subscription_changed(object).await
            }
            WebhookEventKind::SubscriptionDeleted => self.handle_subscription_deleted(object).await,
            WebhookEventKind::TrialWillEnd => self.handle_trial_will_end(object).await,
            WebhookEventKind::InvoicePaymentSucceeded => self.handle_invoice_paid(object).await,
            WebhookEventKind::InvoicePaymentFailed => {
                self.handle_invoice_payment_failed(object).await
            }
            WebhookEventKind::InvoiceFinalized
            | WebhookEventKind::InvoiceVoided
            | WebhookEventKind::InvoiceMarkedUncollectible => {
                self.handle_invoice_updated(kind, object).await
            }
            WebhookEventKind::PaymentMethodAutomaticallyUpdated => {
                self.handle_payment_method_updated(object).await
            }
            WebhookEventKind::CheckoutSessionCompleted => {
                self.handle_checkout_completed(object).await
            }
            WebhookEventKind::Unknown => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook handler failed"
            );
        }
        result.map(|()| WebhookOutcome::Processed)
    }

    async fn handle_subscription_changed(&self, object: &serde_json::Value) -> BillingResult<()> {
        let sub = subscription_from_event(object)?;
        self.subscriptions
            .sync_status(&sub.id, &sub.status, sub.current_period_end)
            .await?;
        Ok(())
    }

    async fn handle_subscription_deleted(&self, object: &serde_json::Value) -> BillingResult<()> {
        let sub = subscription_from_event(object)?;
        let finalized = self
            .subscriptions
            .refund_and_finalize_cancellation(
                &sub.id,
                sub.current_period_start,
                sub.current_period_end,
            )
            .await?;

        if let Some(finalized) = finalized {
            if finalized.change.previous != SubscriptionStatus::Canceled {
                self.notifications.submit(
                    finalized.change.record.workspace_id,
                    BillingNotification::SubscriptionCanceled,
                );
            }
        }
        Ok(())
    }

    async fn handle_trial_will_end(&self, object: &serde_json::Value) -> BillingResult<()> {
        let sub = subscription_from_event(object)?;
        let Some(trial_end) = sub.trial_end else {
            tracing::warn!(subscription_id = %sub.id, "Trial ending event without trial end");
            return Ok(());
        };
        let Some(record) = self.store.get_subscription_by_provider_id(&sub.id).await? else {
            tracing::warn!(subscription_id = %sub.id, "Trial ending for unknown subscription");
            return Ok(());
        };

        self.notifications.submit(
            record.workspace_id,
            BillingNotification::TrialEnding { trial_end },
        );
        Ok(())
    }

    async fn handle_invoice_paid(&self, object: &serde_json::Value) -> BillingResult<()> {
        let invoice = invoice_from_event(object)?;
        self.invoices.cache_provider_invoice(&invoice).await;

        let Some(sub_id) = invoice.subscription_id.as_deref() else {
            tracing::info!(invoice_id = %invoice.id, "Paid invoice has no subscription");
            return Ok(());
        };
        let Some(change) = self.subscriptions.mark_active(sub_id).await? else {
            return Ok(());
        };

        let record = &change.record;
        let plan = match self.store.get_plan(record.plan_id).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(plan_id = %record.plan_id, error = %e, "Failed to load plan for payment notification");
                None
            }
        };
        let first_payment = OffsetDateTime::now_utc() - record.created_at < Duration::hours(24);

        let notification = match plan {
            Some(plan) if first_payment => BillingNotification::SubscriptionConfirmed {
                plan_name: plan.name,
            },
            _ => BillingNotification::PaymentSucceeded {
                amount: invoice.amount_paid,
                currency: invoice.currency.clone().unwrap_or_default(),
            },
        };
        self.notifications.submit(record.workspace_id, notification);
        Ok(())
    }

    async fn handle_invoice_payment_failed(&self, object: &serde_json::Value) -> BillingResult<()> {
        let invoice = invoice_from_event(object)?;
        self.invoices.cache_provider_invoice(&invoice).await;

        let Some(sub_id) = invoice.subscription_id.as_deref() else {
            tracing::info!(invoice_id = %invoice.id, "Failed invoice has no subscription");
            return Ok(());
        };
        let Some(change) = self.subscriptions.mark_past_due(sub_id).await? else {
            return Ok(());
        };

        self.notifications.submit(
            change.record.workspace_id,
            BillingNotification::PaymentFailed {
                amount: invoice.amount_due,
                currency: invoice.currency.clone().unwrap_or_default(),
            },
        );
        Ok(())
    }

    async fn handle_invoice_updated(
        &self,
        kind: WebhookEventKind,
        object: &serde_json::Value,
    ) -> BillingResult<()> {
        let invoice = invoice_from_event(object)?;
        self.invoices.cache_provider_invoice(&invoice).await;

        if kind != WebhookEventKind::InvoiceFinalized {
            tracing::info!(
                invoice_id = %invoice.id,
                status = ?invoice.status,
                subscription_id = ?invoice.subscription_id,
                "Invoice closed without payment"
            );
        }
        Ok(())
    }

    async fn handle_payment_method_updated(&self, object: &serde_json::Value) -> BillingResult<()> {
        let method = payment_method_from_event(object)?;
        tracing::info!(
            payment_method_id = %method.id,
            customer_id = ?method.customer_id,
            "Payment method automatically updated"
        );
        self.customers.refresh_payment_method(&method).await
    }

    async fn handle_checkout_completed(&self, object: &serde_json::Value) -> BillingResult<()> {
        let delivered = checkout_session_from_event(object)?;
        let session = self
            .retry
            .run("checkout_session.retrieve", || {
                self.provider.get_checkout_session(&delivered.id)
            })
            .await?;

        if let Some(setup_intent_id) = session.setup_intent_id.as_deref() {
            self.customers
                .apply_setup_intent(setup_intent_id, session.customer_id.as_deref())
                .await?;
        }
        if let Some(sub_id) = session.subscription_id.as_deref() {
            self.subscriptions.mark_active(sub_id).await?;
        }

        let from_metadata = session
            .metadata
            .get("workspace_id")
            .and_then(|raw| raw.parse::<Uuid>().ok());
        let workspace_id = match (from_metadata, session.customer_id.as_deref()) {
            (Some(id), _) => Some(id),
            (None, Some(customer_id)) => self
                .store
                .get_customer_by_provider_id(customer_id)
                .await?
                .map(|customer| customer.workspace_id),
            (None, None) => None,
        };

        match workspace_id {
            Some(workspace_id) => self
                .events
                .publish(BillingEvent::OnboardingPaymentSucceeded { workspace_id }),
            None => tracing::warn!(
                session_id = %session.id,
                "Completed checkout session has no workspace"
            ),
        }
        Ok(())
    }
}
