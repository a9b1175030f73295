// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::OutstandingInvoices carries every failure
#![allow(clippy::too_many_arguments)] // Service constructors take their collaborators explicitly
#![allow(clippy::type_complexity)] // Boxed futures in store and provider seams
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Ledgerly Billing Module
//!
//! Subscription lifecycle and webhook reconciliation against Stripe.
//!
//! ## Features
//!
//! - **Subscription Lifecycle**: Create, change plan, cancel, resume, schedule changes
//! - **Trials**: Start, extend, and inspect trials; grace periods for past-due accounts
//! - **Plan Guard**: Reject downgrades that lose features or exceed the new limits
//! - **Prorated Refunds**: Credit unused time on immediate cancellation, exactly once
//! - **Webhooks**: Verified, deduplicated reconciliation of Stripe events
//! - **Invoices**: List, download, pay, and create invoices
//! - **Email Notifications**: Welcome, payment succeeded/failed, trial ending, canceled

pub mod checkout;
pub mod client;
pub mod config;
pub mod customer;
pub mod email;
pub mod error;
pub mod events;
pub mod guard;
pub mod invoices;
pub mod notifications;
pub mod plans;
pub mod proration;
pub mod provider;
pub mod refund;
pub mod retry;
pub mod store;
pub mod subscriptions;
pub mod tax;
pub mod trial;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutService, CheckoutSession};

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::BillingConfig;

// Customer
pub use customer::{CustomerService, PaymentMethodSummary, SubscriptionDetails};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult, ProviderErrorKind};

// Events and notifications
pub use events::{BillingEvent, EventBus};
pub use notifications::{BillingNotification, NotificationQueue, Notifier};

// Guard
pub use guard::UsageCounts;

// Invoices
pub use invoices::{InvoiceList, InvoiceService, InvoiceSummary};

// Plans
pub use plans::{BillingCycle, Plan, PlanFeatures, PlanLimits, PlanService, SyncSummary};

// Provider
pub use provider::{PaymentProvider, ProrationMode};

// Refund
pub use refund::{RefundOutcome, RefundService};

// Retry
pub use retry::RetryPolicy;

// Store
pub use store::{run_migrations, BillingStore, MemoryStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{
    FinalizedCancellation, StatusChange, SubscriptionRecord, SubscriptionService,
    SubscriptionStatus,
};

// Tax
pub use tax::{TaxQuote, TaxService};

// Trial
pub use trial::TrialInfo;

// Webhooks
pub use webhooks::{WebhookEventKind, WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub plans: PlanService,
    pub customers: CustomerService,
    pub subscriptions: SubscriptionService,
    pub refunds: RefundService,
    pub checkout: CheckoutService,
    pub invoices: InvoiceService,
    pub tax: TaxService,
    pub webhooks: WebhookHandler,
    pub events: EventBus,
}

impl BillingService {
    /// Create a new billing service from environment variables, backed by Postgres
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        let config = BillingConfig::from_env()?;

        Ok(Self::new(
            Arc::new(stripe),
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(BillingEmailService::from_env()),
            config,
            webhook_secret,
        ))
    }

    /// Create a new billing service from explicit collaborators
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        notifier: Arc<dyn Notifier>,
        config: BillingConfig,
        webhook_secret: Option<String>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        let notifications = NotificationQueue::new(notifier, config.notification_timeout);
        let events = EventBus::new();

        let plans = PlanService::new(store.clone(), provider.clone(), retry);
        let customers = CustomerService::new(store.clone(), provider.clone(), retry);
        let refunds = RefundService::new(store.clone(), provider.clone(), retry);
        let subscriptions = SubscriptionService::new(
            store.clone(),
            provider.clone(),
            plans.clone(),
            customers.clone(),
            refunds.clone(),
            retry,
            config.unit_of_work_retries,
            notifications.clone(),
            events.clone(),
        );
        let checkout = CheckoutService::new(provider.clone(), customers.clone(), retry);
        let invoices = InvoiceService::new(
            store.clone(),
            provider.clone(),
            customers.clone(),
            retry,
        );
        let tax = TaxService::new(provider.clone(), customers.clone(), retry);
        let webhooks = WebhookHandler::new(
            store,
            provider,
            subscriptions.clone(),
            customers.clone(),
            invoices.clone(),
            notifications,
            events.clone(),
            retry,
            webhook_secret,
            config.webhook_tolerance_secs,
        );

        Self {
            plans,
            customers,
            subscriptions,
            refunds,
            checkout,
            invoices,
            tax,
            webhooks,
            events,
        }
    }
}
