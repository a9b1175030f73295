//! Plan catalog
//!
//! The catalog is a static asset (`catalog/plans.json`) compiled into the
//! binary. It is upserted into storage at startup and by the worker's
//! `sync-plans` command; the provider price id is written once, the first
//! time a plan is synced, and never overwritten.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::proration::to_minor_units;
use crate::provider::{CreatePriceParams, CreateProductParams, PaymentProvider};
use crate::retry::RetryPolicy;
use crate::store::BillingStore;

const CATALOG_JSON: &str = include_str!("../catalog/plans.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        match raw {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(BillingError::Internal(format!(
                "Unknown billing cycle: {}",
                other
            ))),
        }
    }
}

/// Boolean capabilities granted by a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFeatures {
    pub customer_management: bool,
    pub inventory_management: bool,
    pub order_management: bool,
    pub expense_management: bool,
    pub accounting: bool,
    pub basic_analytics: bool,
    pub financial_reports: bool,
    pub data_import: bool,
    pub data_export: bool,
    pub advanced_analytics: bool,
    pub advanced_financial_reports: bool,
    pub order_payment_links: bool,
    pub invoice_generation: bool,
    pub export_analytics_data: bool,
    pub ai_business_assistant: bool,
}

impl PlanFeatures {
    /// Every flag with its wire name, in catalog order
    pub fn flags(&self) -> [(&'static str, bool); 15] {
        [
            ("customerManagement", self.customer_management),
            ("inventoryManagement", self.inventory_management),
            ("orderManagement", self.order_management),
            ("expenseManagement", self.expense_management),
            ("accounting", self.accounting),
            ("basicAnalytics", self.basic_analytics),
            ("financialReports", self.financial_reports),
            ("dataImport", self.data_import),
            ("dataExport", self.data_export),
            ("advancedAnalytics", self.advanced_analytics),
            ("advancedFinancialReports", self.advanced_financial_reports),
            ("orderPaymentLinks", self.order_payment_links),
            ("invoiceGeneration", self.invoice_generation),
            ("exportAnalyticsData", self.export_analytics_data),
            ("aiBusinessAssistant", self.ai_business_assistant),
        ]
    }
}

/// Usage limits; [`PlanLimits::UNLIMITED`] disables a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub max_team_members: i64,
    pub max_businesses: i64,
    pub max_orders_per_month: i64,
}

impl PlanLimits {
    pub const UNLIMITED: i64 = -1;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: Uuid,
    pub descriptor: String,
    pub name: String,
    pub description: String,
    /// Price in major currency units
    pub price: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub features: PlanFeatures,
    pub limits: PlanLimits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_price_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price.is_zero()
    }

    pub fn price_minor_units(&self) -> i64 {
        to_minor_units(self.price)
    }

    /// Provider price id, or `PlanNotSynced` if the plan was never synced
    pub fn require_price_id(&self) -> BillingResult<&str> {
        self.provider_price_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BillingError::PlanNotSynced(self.descriptor.clone()))
    }
}

/// One entry of the static catalog
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPlan {
    pub descriptor: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub features: PlanFeatures,
    pub limits: PlanLimits,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    plans: Vec<CatalogPlan>,
}

/// Parse the compiled-in plan catalog
pub fn catalog() -> BillingResult<Vec<CatalogPlan>> {
    let file: CatalogFile = serde_json::from_str(CATALOG_JSON)
        .map_err(|e| BillingError::Config(format!("Invalid plan catalog: {}", e)))?;
    Ok(file.plans)
}

/// Plan lookups, seeding, and provider sync
#[derive(Clone)]
pub struct PlanService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    retry: RetryPolicy,
}

impl PlanService {
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

    /// Upsert every catalog plan by descriptor. Existing provider price ids
    /// are preserved.
    pub async fn seed_catalog(&self) -> BillingResult<usize> {
        let entries = catalog()?;
        for entry in &entries {
            let plan = self.store.upsert_plan(entry).await?;
            tracing::debug!(
                plan_id = %plan.id,
                descriptor = %plan.descriptor,
                synced = plan.provider_price_id.is_some(),
                "Seeded plan"
            );
        }
        tracing::info!(count = entries.len(), "Plan catalog seeded");
        Ok(entries.len())
    }

    pub async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_plans().await
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    pub async fn get_plan_by_descriptor(&self, descriptor: &str) -> BillingResult<Plan> {
        self.store
            .get_plan_by_descriptor(descriptor)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(descriptor.to_string()))
    }

    /// Make sure the plan has a provider price, creating product and price on
    /// first use. Returns the plan as stored afterwards.
    pub async fn ensure_plan_synced(&self, plan: &Plan) -> BillingResult<Plan> {
        if plan.require_price_id().is_ok() {
            return Ok(plan.clone());
        }

        let mut metadata = HashMap::new();
        metadata.insert("plan_id".to_string(), plan.id.to_string());
        metadata.insert("descriptor".to_string(), plan.descriptor.clone());

        let product_params = CreateProductParams {
            name: plan.name.clone(),
            description: plan.description.clone(),
            metadata: metadata.clone(),
        };
        let product_key = format!("product_{}", plan.descriptor);
        let product_id = self
            .retry
            .run("product.create", || {
                self.provider
                    .create_product(&product_params, Some(&product_key))
            })
            .await?;

        let unit_amount = plan.price_minor_units();
        let price_params = CreatePriceParams {
            product_id: product_id.clone(),
            unit_amount,
            currency: plan.currency.clone(),
            interval: plan.billing_cycle,
            metadata,
        };
        let price_key = format!(
            "price_{}_{}_{}",
            plan.descriptor,
            plan.billing_cycle.as_str(),
            unit_amount
        );
        let price_id = self
            .retry
            .run("price.create", || {
                self.provider.create_price(&price_params, Some(&price_key))
            })
            .await?;

        let stored = self
            .store
            .set_plan_price_id_if_absent(plan.id, &price_id)
            .await?;

        if stored.provider_price_id.as_deref() != Some(price_id.as_str()) {
            tracing::warn!(
                plan_id = %plan.id,
                created_price_id = %price_id,
                stored_price_id = ?stored.provider_price_id,
                "Plan already had a provider price, keeping the stored one"
            );
        } else {
            tracing::info!(
                plan_id = %plan.id,
                descriptor = %plan.descriptor,
                product_id = %product_id,
                price_id = %price_id,
                "Synced plan to payment provider"
            );
        }

        Ok(stored)
    }

    /// Sync every stored plan. Failures are logged per plan and counted.
    pub async fn sync_all(&self) -> BillingResult<SyncSummary> {
        let mut summary = SyncSummary::default();
        for plan in self.store.list_plans().await? {
            if plan.require_price_id().is_ok() {
                summary.already_synced += 1;
                continue;
            }
            match self.ensure_plan_synced(&plan).await {
                Ok(_) => summary.synced += 1,
                Err(e) => {
                    tracing::error!(
                        descriptor = %plan.descriptor,
                        error = %e,
                        "Failed to sync plan"
                    );
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub synced: usize,
    pub already_synced: usize,
    pub failed: usize,
}
