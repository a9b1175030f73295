//! Workspace billing routes
//!
//! Every handler takes the workspace from the `X-Workspace-Id` header; the
//! upstream auth layer is responsible for setting it.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use ledgerly_billing::{
    BillingService, CheckoutSession, InvoiceList, InvoiceSummary, PaymentMethodSummary, Plan,
    SubscriptionDetails, SubscriptionRecord, TaxQuote, TrialInfo,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{error::ApiResult, routes::WorkspaceId, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        // Plans
        .route("/plans", get(list_plans))
        .route("/plans/{descriptor}", get(get_plan))
        // Subscription
        .route(
            "/subscription",
            get(get_subscription)
                .post(create_subscription)
                .delete(cancel_subscription),
        )
        .route("/subscription/details", get(subscription_details))
        .route("/subscription/resume", post(resume_subscription))
        .route("/subscription/schedule-change", post(schedule_change))
        .route("/subscription/estimate-proration", post(estimate_proration))
        // Trials and grace period
        .route("/subscription/trial", get(trial_status).post(create_trial))
        .route("/subscription/trial/extend", post(extend_trial))
        .route("/subscription/grace-period", post(grace_period))
        // Payment methods
        .route("/payment-methods/attach", post(attach_payment_method))
        .route("/payment-methods/setup-intent", post(create_setup_intent))
        // Invoices
        .route("/invoices", get(list_invoices).post(create_invoice))
        .route("/invoices/{id}/download", get(download_invoice))
        .route("/invoices/{id}/pay", post(pay_invoice))
        // Checkout and portal
        .route("/checkout/session", post(create_checkout_session))
        .route("/portal/session", post(create_portal_session))
        // Tax
        .route("/tax/calculate", post(calculate_tax))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub plan_descriptor: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleChangeRequest {
    pub plan_descriptor: String,
    pub effective_date: String,
    #[serde(default)]
    pub proration_mode: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleChangeResponse {
    pub schedule_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateProrationRequest {
    pub new_plan_descriptor: String,
}

#[derive(Debug, Serialize)]
pub struct AmountResponse {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTrialRequest {
    pub plan_descriptor: String,
    pub trial_days: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendTrialRequest {
    pub additional_days: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GracePeriodRequest {
    pub grace_days: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GracePeriodResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub grace_period_end: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachPaymentMethodRequest {
    pub payment_method_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupIntentResponse {
    pub setup_intent_id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInvoicesQuery {
    pub status: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceRequest {
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub description: String,
    pub due_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UrlResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub plan_descriptor: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest {
    pub return_url: String,
}

#[derive(Debug, Deserialize)]
pub struct TaxRequest {
    pub amount: i64,
    pub currency: String,
}

/// Look up a plan by descriptor and make sure it has a provider price
async fn synced_plan(billing: &BillingService, descriptor: &str) -> ApiResult<Plan> {
    let plan = billing.plans.get_plan_by_descriptor(descriptor).await?;
    Ok(billing.plans.ensure_plan_synced(&plan).await?)
}

// =============================================================================
// Plans
// =============================================================================

async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    let billing = state.billing()?;
    Ok(Json(billing.plans.list_plans().await?))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(descriptor): Path<String>,
) -> ApiResult<Json<Plan>> {
    let billing = state.billing()?;
    Ok(Json(billing.plans.get_plan_by_descriptor(&descriptor).await?))
}

// =============================================================================
// Subscription
// =============================================================================

async fn get_subscription(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
) -> ApiResult<Json<SubscriptionRecord>> {
    let billing = state.billing()?;
    Ok(Json(
        billing.subscriptions.get_subscription(workspace_id).await?,
    ))
}

async fn create_subscription(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<PlanRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let billing = state.billing()?;
    let plan = synced_plan(billing, &req.plan_descriptor).await?;
    let record = billing
        .subscriptions
        .create_or_update(workspace_id, &plan)
        .await?;
    Ok(Json(record))
}

async fn cancel_subscription(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
) -> ApiResult<Json<SubscriptionRecord>> {
    let billing = state.billing()?;
    Ok(Json(
        billing.subscriptions.cancel_immediately(workspace_id).await?,
    ))
}

async fn subscription_details(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
) -> ApiResult<Json<SubscriptionDetails>> {
    let billing = state.billing()?;
    Ok(Json(
        billing.customers.subscription_details(workspace_id).await?,
    ))
}

async fn resume_subscription(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
) -> ApiResult<Json<SubscriptionRecord>> {
    let billing = state.billing()?;
    Ok(Json(
        billing.subscriptions.resume_if_no_due(workspace_id).await?,
    ))
}

async fn schedule_change(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<ScheduleChangeRequest>,
) -> ApiResult<Json<ScheduleChangeResponse>> {
    let billing = state.billing()?;
    let plan = billing
        .plans
        .get_plan_by_descriptor(&req.plan_descriptor)
        .await?;
    let schedule_id = billing
        .subscriptions
        .schedule_change(workspace_id, &plan, &req.effective_date, &req.proration_mode)
        .await?;
    Ok(Json(ScheduleChangeResponse { schedule_id }))
}

async fn estimate_proration(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<EstimateProrationRequest>,
) -> ApiResult<Json<AmountResponse>> {
    let billing = state.billing()?;
    let amount = billing
        .subscriptions
        .estimate_proration(workspace_id, &req.new_plan_descriptor)
        .await?;
    Ok(Json(AmountResponse { amount }))
}

// =============================================================================
// Trials and grace period
// =============================================================================

async fn create_trial(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<CreateTrialRequest>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let billing = state.billing()?;
    let plan = synced_plan(billing, &req.plan_descriptor).await?;
    let record = billing
        .subscriptions
        .create_trial(workspace_id, &plan, req.trial_days)
        .await?;
    Ok(Json(record))
}

async fn trial_status(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
) -> ApiResult<Json<TrialInfo>> {
    let billing = state.billing()?;
    Ok(Json(
        billing.subscriptions.check_trial_status(workspace_id).await?,
    ))
}

async fn extend_trial(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<ExtendTrialRequest>,
) -> ApiResult<Json<TrialInfo>> {
    let billing = state.billing()?;
    let info = billing
        .subscriptions
        .extend_trial(workspace_id, req.additional_days)
        .await?;
    Ok(Json(info))
}

async fn grace_period(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<GracePeriodRequest>,
) -> ApiResult<Json<GracePeriodResponse>> {
    let billing = state.billing()?;
    let grace_period_end = billing
        .subscriptions
        .handle_grace_period(workspace_id, req.grace_days)
        .await?;
    Ok(Json(GracePeriodResponse { grace_period_end }))
}

// =============================================================================
// Payment methods
// =============================================================================

async fn attach_payment_method(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<AttachPaymentMethodRequest>,
) -> ApiResult<Json<PaymentMethodSummary>> {
    let billing = state.billing()?;
    let summary = billing
        .customers
        .attach_payment_method(workspace_id, &req.payment_method_id)
        .await?;
    Ok(Json(summary))
}

async fn create_setup_intent(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
) -> ApiResult<Json<SetupIntentResponse>> {
    let billing = state.billing()?;
    let intent = billing.customers.create_setup_intent(workspace_id).await?;
    Ok(Json(SetupIntentResponse {
        setup_intent_id: intent.id,
        client_secret: intent.client_secret,
    }))
}

// =============================================================================
// Invoices
// =============================================================================

async fn list_invoices(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Query(query): Query<ListInvoicesQuery>,
) -> ApiResult<Json<InvoiceList>> {
    let billing = state.billing()?;
    let list = billing
        .invoices
        .list_invoices(
            workspace_id,
            query.status.as_deref().filter(|s| !s.is_empty()),
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(0),
        )
        .await?;
    Ok(Json(list))
}

async fn create_invoice(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<CreateInvoiceRequest>,
) -> ApiResult<Json<InvoiceSummary>> {
    let billing = state.billing()?;
    let invoice = billing
        .invoices
        .create_invoice(
            workspace_id,
            req.amount,
            &req.currency,
            &req.description,
            req.due_date.as_deref().filter(|d| !d.is_empty()),
        )
        .await?;
    Ok(Json(invoice))
}

async fn download_invoice(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Path(invoice_id): Path<String>,
) -> ApiResult<Json<UrlResponse>> {
    let billing = state.billing()?;
    let url = billing
        .invoices
        .download_url(workspace_id, &invoice_id)
        .await?;
    Ok(Json(UrlResponse { url }))
}

async fn pay_invoice(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Path(invoice_id): Path<String>,
) -> ApiResult<Json<InvoiceSummary>> {
    let billing = state.billing()?;
    Ok(Json(
        billing.invoices.pay_invoice(workspace_id, &invoice_id).await?,
    ))
}

// =============================================================================
// Checkout, portal, and tax
// =============================================================================

async fn create_checkout_session(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutSession>> {
    let billing = state.billing()?;
    let plan = synced_plan(billing, &req.plan_descriptor).await?;
    let session = billing
        .checkout
        .create_checkout_session(workspace_id, &plan, &req.success_url, &req.cancel_url)
        .await?;
    Ok(Json(session))
}

async fn create_portal_session(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<UrlResponse>> {
    let billing = state.billing()?;
    let url = billing
        .customers
        .create_portal_session(workspace_id, &req.return_url)
        .await?;
    Ok(Json(UrlResponse { url }))
}

async fn calculate_tax(
    State(state): State<AppState>,
    WorkspaceId(workspace_id): WorkspaceId,
    Json(req): Json<TaxRequest>,
) -> ApiResult<Json<TaxQuote>> {
    let billing = state.billing()?;
    let quote = billing
        .tax
        .calculate_tax(workspace_id, req.amount, &req.currency)
        .await?;
    Ok(Json(quote))
}
