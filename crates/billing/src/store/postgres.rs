//! PostgreSQL store

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingCustomer, BillingStore, InvoiceRecord, RefundRecord, StoreTx, WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::guard::UsageCounts;
use crate::plans::{BillingCycle, CatalogPlan, Plan, PlanFeatures, PlanLimits};
use crate::subscriptions::{SubscriptionRecord, SubscriptionStatus};

const PLAN_COLUMNS: &str = "id, descriptor, name, description, price, currency, billing_cycle, \
     features, limits, provider_price_id, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, workspace_id, plan_id, provider_subscription_id, status, \
     current_period_end, created_at, updated_at";

/// Apply the billing schema migrations
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Database(format!("Migration failed: {}", e)))
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    descriptor: String,
    name: String,
    description: String,
    price: Decimal,
    currency: String,
    billing_cycle: String,
    features: Json<PlanFeatures>,
    limits: Json<PlanLimits>,
    provider_price_id: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Plan {
            id: row.id,
            descriptor: row.descriptor,
            name: row.name,
            description: row.description,
            price: row.price,
            currency: row.currency,
            billing_cycle: BillingCycle::parse(&row.billing_cycle)?,
            features: row.features.0,
            limits: row.limits.0,
            provider_price_id: row.provider_price_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    workspace_id: Uuid,
    plan_id: Uuid,
    provider_subscription_id: String,
    status: String,
    current_period_end: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionRecord {
            id: row.id,
            workspace_id: row.workspace_id,
            plan_id: row.plan_id,
            provider_subscription_id: row.provider_subscription_id,
            status: row.status.parse()?,
            current_period_end: row.current_period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    workspace_id: Uuid,
    provider_customer_id: String,
    default_payment_method_id: Option<String>,
    created_at: OffsetDateTime,
}

impl From<CustomerRow> for BillingCustomer {
    fn from(row: CustomerRow) -> Self {
        BillingCustomer {
            workspace_id: row.workspace_id,
            provider_customer_id: row.provider_customer_id,
            default_payment_method_id: row.default_payment_method_id,
            created_at: row.created_at,
        }
    }
}

fn subscriptions(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<SubscriptionRecord>> {
    rows.into_iter().map(SubscriptionRecord::try_from).collect()
}

/// Store backed by the shared PostgreSQL pool
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn count(&self, sql: &str, workspace_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(sql)
            .bind(workspace_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn upsert_plan(&self, entry: &CatalogPlan) -> BillingResult<Plan> {
        let sql = format!(
            r#"
            INSERT INTO billing_plans
                (id, descriptor, name, description, price, currency, billing_cycle, features, limits)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (descriptor) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                price = EXCLUDED.price,
                currency = EXCLUDED.currency,
                billing_cycle = EXCLUDED.billing_cycle,
                features = EXCLUDED.features,
                limits = EXCLUDED.limits,
                updated_at = NOW()
            RETURNING {}
            "#,
            PLAN_COLUMNS
        );

        let row: PlanRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&entry.descriptor)
            .bind(&entry.name)
            .bind(&entry.description)
            .bind(entry.price)
            .bind(&entry.currency)
            .bind(entry.billing_cycle.as_str())
            .bind(Json(entry.features))
            .bind(Json(entry.limits))
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let sql = format!("SELECT {} FROM billing_plans ORDER BY price, descriptor", PLAN_COLUMNS);
        let rows: Vec<PlanRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(Plan::try_from).collect()
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let sql = format!("SELECT {} FROM billing_plans WHERE id = $1", PLAN_COLUMNS);
        let row: Option<PlanRow> = sqlx::query_as(&sql)
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Plan::try_from).transpose()
    }

    async fn get_plan_by_descriptor(&self, descriptor: &str) -> BillingResult<Option<Plan>> {
        let sql = format!(
            "SELECT {} FROM billing_plans WHERE descriptor = $1",
            PLAN_COLUMNS
        );
        let row: Option<PlanRow> = sqlx::query_as(&sql)
            .bind(descriptor)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Plan::try_from).transpose()
    }

    async fn set_plan_price_id_if_absent(
        &self,
        plan_id: Uuid,
        price_id: &str,
    ) -> BillingResult<Plan> {
        let sql = format!(
            r#"
            UPDATE billing_plans
            SET provider_price_id = COALESCE(NULLIF(provider_price_id, ''), $2),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            PLAN_COLUMNS
        );
        let row: Option<PlanRow> = sqlx::query_as(&sql)
            .bind(plan_id)
            .bind(price_id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))?
            .try_into()
    }

    async fn get_subscription(
        &self,
        workspace_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM billing_subscriptions WHERE workspace_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn get_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM billing_subscriptions WHERE provider_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(provider_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn list_subscriptions_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM billing_subscriptions WHERE status = $1 ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        subscriptions(rows)
    }

    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn webhook_event_exists(&self, event_id: &str) -> BillingResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM billing_webhook_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_webhook_events (event_id, event_type, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_webhook_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<(String, String, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, processed_at
            FROM billing_webhook_events
            ORDER BY processed_at DESC, event_id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(event_id, event_type, processed_at)| WebhookEventRecord {
                event_id,
                event_type,
                processed_at,
            })
            .collect())
    }

    async fn upsert_invoice_record(&self, record: &InvoiceRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_invoice_records
                (workspace_id, provider_invoice_id, hosted_invoice_url, invoice_pdf_url, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workspace_id, provider_invoice_id) DO UPDATE SET
                hosted_invoice_url = COALESCE(EXCLUDED.hosted_invoice_url, billing_invoice_records.hosted_invoice_url),
                invoice_pdf_url = COALESCE(EXCLUDED.invoice_pdf_url, billing_invoice_records.invoice_pdf_url),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.workspace_id)
        .bind(&record.provider_invoice_id)
        .bind(&record.hosted_invoice_url)
        .bind(&record.invoice_pdf_url)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_invoice_record(
        &self,
        workspace_id: Uuid,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<InvoiceRecord>> {
        let row: Option<(Option<String>, Option<String>, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT hosted_invoice_url, invoice_pdf_url, updated_at
            FROM billing_invoice_records
            WHERE workspace_id = $1 AND provider_invoice_id = $2
            "#,
        )
        .bind(workspace_id)
        .bind(provider_invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(hosted_invoice_url, invoice_pdf_url, updated_at)| InvoiceRecord {
                workspace_id,
                provider_invoice_id: provider_invoice_id.to_string(),
                hosted_invoice_url,
                invoice_pdf_url,
                updated_at,
            },
        ))
    }

    async fn get_customer(&self, workspace_id: Uuid) -> BillingResult<Option<BillingCustomer>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r#"
            SELECT workspace_id, provider_customer_id, default_payment_method_id, created_at
            FROM billing_customers
            WHERE workspace_id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_customer_by_provider_id(
        &self,
        provider_customer_id: &str,
    ) -> BillingResult<Option<BillingCustomer>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r#"
            SELECT workspace_id, provider_customer_id, default_payment_method_id, created_at
            FROM billing_customers
            WHERE provider_customer_id = $1
            "#,
        )
        .bind(provider_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_customer(
        &self,
        workspace_id: Uuid,
        provider_customer_id: &str,
    ) -> BillingResult<BillingCustomer> {
        sqlx::query(
            r#"
            INSERT INTO billing_customers (workspace_id, provider_customer_id, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (workspace_id) DO NOTHING
            "#,
        )
        .bind(workspace_id)
        .bind(provider_customer_id)
        .execute(&self.pool)
        .await?;

        self.get_customer(workspace_id)
            .await?
            .ok_or_else(|| BillingError::Internal("Customer mapping vanished after insert".into()))
    }

    async fn set_default_payment_method(
        &self,
        workspace_id: Uuid,
        payment_method_id: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE billing_customers SET default_payment_method_id = $2 WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .bind(payment_method_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_counts(
        &self,
        workspace_id: Uuid,
        month_start: OffsetDateTime,
    ) -> BillingResult<UsageCounts> {
        let team_members = self
            .count(
                "SELECT COUNT(*) FROM workspace_members WHERE workspace_id = $1",
                workspace_id,
            )
            .await?;
        let businesses = self
            .count(
                "SELECT COUNT(*) FROM businesses WHERE workspace_id = $1",
                workspace_id,
            )
            .await?;
        let orders_this_month: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM orders WHERE workspace_id = $1 AND created_at >= $2",
        )
        .bind(workspace_id)
        .bind(month_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageCounts {
            team_members,
            businesses,
            orders_this_month,
        })
    }

    async fn record_refund(&self, record: &RefundRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_refund_records
                (provider_invoice_id, provider_subscription_id, amount, credit_note_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.provider_invoice_id)
        .bind(&record.provider_subscription_id)
        .bind(record.amount)
        .bind(&record.credit_note_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// `BEGIN ... SELECT ... FOR UPDATE ... COMMIT`; rolls back on drop
struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn subscription_for_update(
        &mut self,
        workspace_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM billing_subscriptions WHERE workspace_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(workspace_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn subscription_by_provider_id_for_update(
        &mut self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM billing_subscriptions WHERE provider_subscription_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(provider_subscription_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn insert_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_subscriptions
                (id, workspace_id, plan_id, provider_subscription_id, status,
                 current_period_end, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.workspace_id)
        .bind(record.plan_id)
        .bind(&record.provider_subscription_id)
        .bind(record.status.as_str())
        .bind(record.current_period_end)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing_subscriptions
            SET plan_id = $2,
                provider_subscription_id = $3,
                status = $4,
                current_period_end = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.plan_id)
        .bind(&record.provider_subscription_id)
        .bind(record.status.as_str())
        .bind(record.current_period_end)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::SubscriptionNotFound(
                record.workspace_id.to_string(),
            ));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
