//! Billing persistence
//!
//! [`BillingStore`] is the only way billing code reaches storage. Writes to
//! subscription rows go through a [`StoreTx`] so a read-modify-write is
//! serialized per workspace; everything else is a single statement.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{run_migrations, PgBillingStore};

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::guard::UsageCounts;
use crate::plans::{CatalogPlan, Plan};
use crate::subscriptions::{SubscriptionRecord, SubscriptionStatus};

/// A webhook event that was dispatched successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

/// Cached invoice links, used for display only
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRecord {
    pub workspace_id: Uuid,
    pub provider_invoice_id: String,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Mapping between a workspace and its provider customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingCustomer {
    pub workspace_id: Uuid,
    pub provider_customer_id: String,
    pub default_payment_method_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Audit row for a prorated refund issued as a credit note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRecord {
    pub provider_invoice_id: String,
    pub provider_subscription_id: String,
    /// Minor currency units
    pub amount: i64,
    pub credit_note_id: String,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Plans

    /// Insert or update a plan by descriptor, keeping any provider price id
    async fn upsert_plan(&self, entry: &CatalogPlan) -> BillingResult<Plan>;
    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;
    async fn get_plan_by_descriptor(&self, descriptor: &str) -> BillingResult<Option<Plan>>;
    /// Set the provider price id unless one is already stored. Returns the
    /// plan as it is stored afterwards.
    async fn set_plan_price_id_if_absent(
        &self,
        plan_id: Uuid,
        price_id: &str,
    ) -> BillingResult<Plan>;

    // Subscriptions

    async fn get_subscription(&self, workspace_id: Uuid)
        -> BillingResult<Option<SubscriptionRecord>>;
    async fn get_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;
    async fn list_subscriptions_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> BillingResult<Vec<SubscriptionRecord>>;
    /// Start a unit of work. Dropping the returned transaction without
    /// committing discards its writes.
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>>;

    // Webhook events

    async fn webhook_event_exists(&self, event_id: &str) -> BillingResult<bool>;
    /// Returns `false` when the event id was already recorded
    async fn record_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;
    async fn list_webhook_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    // Invoice link cache

    async fn upsert_invoice_record(&self, record: &InvoiceRecord) -> BillingResult<()>;
    async fn get_invoice_record(
        &self,
        workspace_id: Uuid,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<InvoiceRecord>>;

    // Customers

    async fn get_customer(&self, workspace_id: Uuid) -> BillingResult<Option<BillingCustomer>>;
    async fn get_customer_by_provider_id(
        &self,
        provider_customer_id: &str,
    ) -> BillingResult<Option<BillingCustomer>>;
    /// Store the mapping. If the workspace already has one, the existing
    /// mapping is returned unchanged.
    async fn insert_customer(
        &self,
        workspace_id: Uuid,
        provider_customer_id: &str,
    ) -> BillingResult<BillingCustomer>;
    async fn set_default_payment_method(
        &self,
        workspace_id: Uuid,
        payment_method_id: Option<&str>,
    ) -> BillingResult<()>;

    // Usage and audit

    /// Team members, businesses, and orders created since `month_start`
    async fn usage_counts(
        &self,
        workspace_id: Uuid,
        month_start: OffsetDateTime,
    ) -> BillingResult<UsageCounts>;
    async fn record_refund(&self, record: &RefundRecord) -> BillingResult<()>;
}

/// Unit of work over subscription rows.
///
/// Rows read through `*_for_update` stay locked until commit or drop.
#[async_trait]
pub trait StoreTx: Send {
    async fn subscription_for_update(
        &mut self,
        workspace_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;
    async fn subscription_by_provider_id_for_update(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;
    async fn insert_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()>;
    async fn update_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()>;
    async fn commit(self: Box<Self>) -> BillingResult<()>;
}
