//! In-memory store for tests and local development

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    BillingCustomer, BillingStore, InvoiceRecord, RefundRecord, StoreTx, WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::guard::UsageCounts;
use crate::plans::{CatalogPlan, Plan};
use crate::subscriptions::{SubscriptionRecord, SubscriptionStatus};

#[derive(Default)]
struct Tables {
    plans: HashMap<Uuid, Plan>,
    webhook_events: Vec<WebhookEventRecord>,
    invoices: HashMap<(Uuid, String), InvoiceRecord>,
    customers: HashMap<Uuid, BillingCustomer>,
    usage: HashMap<Uuid, UsageCounts>,
    refunds: Vec<RefundRecord>,
}

/// Subscription rows keyed by workspace
type SubscriptionTable = HashMap<Uuid, SubscriptionRecord>;

/// Store that keeps everything in process memory.
///
/// A transaction holds the subscription table lock until it commits or is
/// dropped, so do not call the non-transactional subscription reads while a
/// transaction from the same task is open.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    subscriptions: Arc<Mutex<SubscriptionTable>>,
    commit_conflicts: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage counts returned for a workspace; unset workspaces report zero
    pub async fn set_usage(&self, workspace_id: Uuid, usage: UsageCounts) {
        self.tables.lock().await.usage.insert(workspace_id, usage);
    }

    /// Write a subscription row directly, bypassing the lifecycle rules
    pub async fn put_subscription(&self, record: SubscriptionRecord) {
        self.subscriptions
            .lock()
            .await
            .insert(record.workspace_id, record);
    }

    /// Make the next `n` commits fail with `ConcurrentModification`
    pub fn inject_commit_conflicts(&self, n: usize) {
        self.commit_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn refunds(&self) -> Vec<RefundRecord> {
        self.tables.lock().await.refunds.clone()
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.tables.lock().await.webhook_events.len()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn upsert_plan(&self, entry: &CatalogPlan) -> BillingResult<Plan> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();

        let existing = tables
            .plans
            .values_mut()
            .find(|p| p.descriptor == entry.descriptor);

        let plan = match existing {
            Some(plan) => {
                plan.name = entry.name.clone();
                plan.description = entry.description.clone();
                plan.price = entry.price;
                plan.currency = entry.currency.clone();
                plan.billing_cycle = entry.billing_cycle;
                plan.features = entry.features;
                plan.limits = entry.limits;
                plan.updated_at = now;
                plan.clone()
            }
            None => {
                let plan = Plan {
                    id: Uuid::new_v4(),
                    descriptor: entry.descriptor.clone(),
                    name: entry.name.clone(),
                    description: entry.description.clone(),
                    price: entry.price,
                    currency: entry.currency.clone(),
                    billing_cycle: entry.billing_cycle,
                    features: entry.features,
                    limits: entry.limits,
                    provider_price_id: None,
                    created_at: now,
                    updated_at: now,
                };
                tables.plans.insert(plan.id, plan.clone());
                plan
            }
        };
        Ok(plan)
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let tables = self.tables.lock().await;
        let mut plans: Vec<Plan> = tables.plans.values().cloned().collect();
        plans.sort_by(|a, b| {
            a.price
                .cmp(&b.price)
                .then_with(|| a.descriptor.cmp(&b.descriptor))
        });
        Ok(plans)
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.tables.lock().await.plans.get(&plan_id).cloned())
    }

    async fn get_plan_by_descriptor(&self, descriptor: &str) -> BillingResult<Option<Plan>> {
        Ok(self
            .tables
            .lock()
            .await
            .plans
            .values()
            .find(|p| p.descriptor == descriptor)
            .cloned())
    }

    async fn set_plan_price_id_if_absent(
        &self,
        plan_id: Uuid,
        price_id: &str,
    ) -> BillingResult<Plan> {
        let mut tables = self.tables.lock().await;
        let plan = tables
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))?;

        if plan.provider_price_id.as_deref().unwrap_or("").is_empty() {
            plan.provider_price_id = Some(price_id.to_string());
        }
        plan.updated_at = OffsetDateTime::now_utc();
        Ok(plan.clone())
    }

    async fn get_subscription(
        &self,
        workspace_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.subscriptions.lock().await.get(&workspace_id).cloned())
    }

    async fn get_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .subscriptions
            .lock()
            .await
            .values()
            .find(|s| s.provider_subscription_id == provider_subscription_id)
            .cloned())
    }

    async fn list_subscriptions_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let table = self.subscriptions.lock().await;
        let mut rows: Vec<SubscriptionRecord> = table
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.created_at);
        Ok(rows)
    }

    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.subscriptions).lock_owned().await;
        Ok(Box::new(MemoryTx {
            guard,
            staged: HashMap::new(),
            commit_conflicts: Arc::clone(&self.commit_conflicts),
        }))
    }

    async fn webhook_event_exists(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .webhook_events
            .iter()
            .any(|e| e.event_id == event_id))
    }

    async fn record_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.webhook_events.iter().any(|e| e.event_id == event_id) {
            return Ok(false);
        }
        tables.webhook_events.push(WebhookEventRecord {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            processed_at: OffsetDateTime::now_utc(),
        });
        Ok(true)
    }

    async fn list_webhook_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .webhook_events
            .iter()
            .rev()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn upsert_invoice_record(&self, record: &InvoiceRecord) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        let key = (record.workspace_id, record.provider_invoice_id.clone());
        let merged = match tables.invoices.get(&key) {
            Some(existing) => InvoiceRecord {
                hosted_invoice_url: record
                    .hosted_invoice_url
                    .clone()
                    .or_else(|| existing.hosted_invoice_url.clone()),
                invoice_pdf_url: record
                    .invoice_pdf_url
                    .clone()
                    .or_else(|| existing.invoice_pdf_url.clone()),
                ..record.clone()
            },
            None => record.clone(),
        };
        tables.invoices.insert(key, merged);
        Ok(())
    }

    async fn get_invoice_record(
        &self,
        workspace_id: Uuid,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<InvoiceRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .invoices
            .get(&(workspace_id, provider_invoice_id.to_string()))
            .cloned())
    }

    async fn get_customer(&self, workspace_id: Uuid) -> BillingResult<Option<BillingCustomer>> {
        Ok(self.tables.lock().await.customers.get(&workspace_id).cloned())
    }

    async fn get_customer_by_provider_id(
        &self,
        provider_customer_id: &str,
    ) -> BillingResult<Option<BillingCustomer>> {
        Ok(self
            .tables
            .lock()
            .await
            .customers
            .values()
            .find(|c| c.provider_customer_id == provider_customer_id)
            .cloned())
    }

    async fn insert_customer(
        &self,
        workspace_id: Uuid,
        provider_customer_id: &str,
    ) -> BillingResult<BillingCustomer> {
        let mut tables = self.tables.lock().await;
        let customer = tables
            .customers
            .entry(workspace_id)
            .or_insert_with(|| BillingCustomer {
                workspace_id,
                provider_customer_id: provider_customer_id.to_string(),
                default_payment_method_id: None,
                created_at: OffsetDateTime::now_utc(),
            });
        Ok(customer.clone())
    }

    async fn set_default_payment_method(
        &self,
        workspace_id: Uuid,
        payment_method_id: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(customer) = self.tables.lock().await.customers.get_mut(&workspace_id) {
            customer.default_payment_method_id = payment_method_id.map(str::to_string);
        }
        Ok(())
    }

    async fn usage_counts(
        &self,
        workspace_id: Uuid,
        _month_start: OffsetDateTime,
    ) -> BillingResult<UsageCounts> {
        Ok(self
            .tables
            .lock()
            .await
            .usage
            .get(&workspace_id)
            .copied()
            .unwrap_or_default())
    }

    async fn record_refund(&self, record: &RefundRecord) -> BillingResult<()> {
        self.tables.lock().await.refunds.push(record.clone());
        Ok(())
    }
}

/// Holds the subscription table lock; writes are staged until commit
struct MemoryTx {
    guard: OwnedMutexGuard<SubscriptionTable>,
    staged: SubscriptionTable,
    commit_conflicts: Arc<AtomicUsize>,
}

impl MemoryTx {
    fn current(&self, workspace_id: &Uuid) -> Option<&SubscriptionRecord> {
        self.staged
            .get(workspace_id)
            .or_else(|| self.guard.get(workspace_id))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn subscription_for_update(
        &mut self,
        workspace_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.current(&workspace_id).cloned())
    }

    async fn subscription_by_provider_id_for_update(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let workspace_id = self
            .staged
            .values()
            .chain(self.guard.values())
            .find(|s| s.provider_subscription_id == provider_subscription_id)
            .map(|s| s.workspace_id);

        Ok(workspace_id.and_then(|ws| self.current(&ws).cloned()))
    }

    async fn insert_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()> {
        if self.current(&record.workspace_id).is_some() {
            // workspace_id is unique
            return Err(BillingError::ConcurrentModification);
        }
        self.staged.insert(record.workspace_id, record.clone());
        Ok(())
    }

    async fn update_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()> {
        match self.current(&record.workspace_id) {
            Some(existing) if existing.id == record.id => {
                self.staged.insert(record.workspace_id, record.clone());
                Ok(())
            }
            _ => Err(BillingError::SubscriptionNotFound(
                record.workspace_id.to_string(),
            )),
        }
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryTx {
            mut guard,
            staged,
            commit_conflicts,
        } = *self;

        let conflict = commit_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            return Err(BillingError::ConcurrentModification);
        }

        guard.extend(staged);
        Ok(())
    }
}
