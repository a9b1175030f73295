//! Payment provider seam
//!
//! The lifecycle engine talks to the payment provider only through
//! [`PaymentProvider`]. [`crate::client::StripeClient`] is the production
//! implementation; tests substitute a recording fake.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::plans::BillingCycle;

/// How the provider should handle a first payment that needs customer action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentBehavior {
    AllowIncomplete,
    DefaultIncomplete,
    ErrorIfIncomplete,
}

impl PaymentBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentBehavior::AllowIncomplete => "allow_incomplete",
            PaymentBehavior::DefaultIncomplete => "default_incomplete",
            PaymentBehavior::ErrorIfIncomplete => "error_if_incomplete",
        }
    }
}

/// Proration behavior accepted by subscription updates and schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationMode {
    None,
    CreateProrations,
    AlwaysInvoice,
}

impl ProrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProrationMode::None => "none",
            ProrationMode::CreateProrations => "create_prorations",
            ProrationMode::AlwaysInvoice => "always_invoice",
        }
    }
}

impl FromStr for ProrationMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ProrationMode::None),
            "create_prorations" => Ok(ProrationMode::CreateProrations),
            "always_invoice" => Ok(ProrationMode::AlwaysInvoice),
            other => Err(BillingError::InvalidProrationMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    Setup,
    Subscription,
}

impl CheckoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutMode::Setup => "setup",
            CheckoutMode::Subscription => "subscription",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
    pub default_payment_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    /// Raw provider status, e.g. `active`, `incomplete_expired`
    pub status: String,
    pub item_id: Option<String>,
    pub price_id: Option<String>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_end: Option<OffsetDateTime>,
    pub created: OffsetDateTime,
}

impl ProviderSubscription {
    pub fn is_canceled(&self) -> bool {
        matches!(self.status.as_str(), "canceled" | "incomplete_expired")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderInvoice {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub number: Option<String>,
    /// `draft`, `open`, `paid`, `uncollectible` or `void`
    pub status: Option<String>,
    pub currency: Option<String>,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub created: Option<OffsetDateTime>,
    pub due_date: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceListFilter {
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub status: Option<String>,
    pub limit: u64,
    pub starting_after: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InvoicePage {
    pub invoices: Vec<ProviderInvoice>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCreditNote {
    pub id: String,
    pub invoice_id: String,
    pub amount: i64,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub brand: String,
    pub last4: String,
    pub exp_month: i64,
    pub exp_year: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodInfo {
    pub id: String,
    /// Provider payment method type, e.g. `card`
    pub kind: String,
    pub customer_id: Option<String>,
    pub card: Option<CardInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupIntentInfo {
    pub id: String,
    pub status: String,
    pub client_secret: Option<String>,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionInfo {
    pub id: String,
    pub url: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub setup_intent_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxCalculation {
    pub id: Option<String>,
    pub currency: String,
    pub amount_total: i64,
    pub tax_amount_exclusive: i64,
    pub tax_amount_inclusive: i64,
}

/// An event as delivered by the provider's webhook or events API
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: ProviderEventData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionParams {
    pub customer_id: String,
    pub price_id: String,
    pub payment_behavior: PaymentBehavior,
    pub proration_behavior: Option<ProrationMode>,
    pub trial_end: Option<OffsetDateTime>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionParams {
    /// Existing subscription item to reprice
    pub item_id: Option<String>,
    pub price_id: Option<String>,
    pub payment_behavior: Option<PaymentBehavior>,
    pub proration_behavior: Option<ProrationMode>,
    pub trial_end: Option<OffsetDateTime>,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct CreateScheduleParams {
    /// Subscription the schedule takes over
    pub from_subscription: String,
    pub start_date: OffsetDateTime,
    pub price_id: String,
    pub proration_behavior: Option<ProrationMode>,
}

#[derive(Debug, Clone)]
pub struct CreateCreditNoteParams {
    pub invoice_id: String,
    pub refund_amount: i64,
    pub reason: String,
    pub memo: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceItemParams {
    pub customer_id: String,
    pub amount: i64,
    pub currency: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceParams {
    pub customer_id: String,
    pub description: Option<String>,
    pub due_date: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct CreateCheckoutParams {
    pub customer_id: String,
    pub mode: CheckoutMode,
    pub price_id: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateProductParams {
    pub name: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreatePriceParams {
    pub product_id: String,
    pub unit_amount: i64,
    pub currency: String,
    pub interval: BillingCycle,
    pub metadata: HashMap<String, String>,
}

/// Operations the billing engine needs from a payment provider.
///
/// Calls that create or mutate provider state accept an optional idempotency
/// key so a retried request cannot duplicate the side effect.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    // Customers
    async fn create_customer(
        &self,
        email: Option<&str>,
        metadata: HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderCustomer>;
    async fn get_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer>;
    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderCustomer>;

    // Subscriptions
    async fn create_subscription(
        &self,
        params: &CreateSubscriptionParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderSubscription>;
    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: &UpdateSubscriptionParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderSubscription>;
    /// Cancels immediately without invoicing or prorating
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderSubscription>;
    /// Returns `None` when the provider no longer knows the subscription
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>>;
    async fn create_subscription_schedule(
        &self,
        params: &CreateScheduleParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<String>;

    // Invoices
    async fn list_invoices(&self, filter: &InvoiceListFilter) -> BillingResult<InvoicePage>;
    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice>;
    async fn finalize_invoice(
        &self,
        invoice_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderInvoice>;
    async fn pay_invoice(
        &self,
        invoice_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderInvoice>;
    async fn create_invoice_item(
        &self,
        params: &CreateInvoiceItemParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<String>;
    async fn create_invoice(
        &self,
        params: &CreateInvoiceParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderInvoice>;

    // Credit notes
    async fn list_credit_notes(
        &self,
        invoice_id: &str,
        limit: u64,
    ) -> BillingResult<Vec<ProviderCreditNote>>;
    async fn create_credit_note(
        &self,
        params: &CreateCreditNoteParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderCreditNote>;

    // Payment methods and setup
    async fn get_payment_method(&self, payment_method_id: &str)
        -> BillingResult<PaymentMethodInfo>;
    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<PaymentMethodInfo>;
    async fn create_setup_intent(
        &self,
        customer_id: &str,
        metadata: HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<SetupIntentInfo>;
    async fn get_setup_intent(&self, setup_intent_id: &str) -> BillingResult<SetupIntentInfo>;

    // Hosted pages
    async fn create_checkout_session(
        &self,
        params: &CreateCheckoutParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutSessionInfo>;
    async fn get_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSessionInfo>;
    async fn create_portal_session(&self, customer_id: &str, return_url: &str)
        -> BillingResult<String>;

    // Tax
    async fn calculate_tax(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
    ) -> BillingResult<TaxCalculation>;
    async fn update_tax_settings(&self, default_tax_code: &str) -> BillingResult<()>;

    // Catalog
    async fn create_product(
        &self,
        params: &CreateProductParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<String>;
    async fn create_price(
        &self,
        params: &CreatePriceParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<String>;

    // Events
    async fn get_event(&self, event_id: &str) -> BillingResult<ProviderEvent>;
}
