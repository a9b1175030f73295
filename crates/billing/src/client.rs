//! Stripe client
//!
//! Wraps `async-stripe` and implements [`PaymentProvider`]. Typed SDK calls are
//! used for customers and subscriptions; the remaining endpoints go through the
//! client's form/query helpers with local wire structs, which keeps us tolerant
//! of API-version drift in objects we only read a handful of fields from.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stripe::{
    CancelSubscription, CreateCustomer, Customer, CustomerId, CustomerInvoiceSettings,
    RequestStrategy, StripeError, Subscription, SubscriptionId, UpdateCustomer,
};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult, ProviderErrorKind};
use crate::plans::BillingCycle;
use crate::provider::{
    CardInfo, CheckoutSessionInfo, CreateCheckoutParams, CreateCreditNoteParams,
    CreateInvoiceItemParams, CreateInvoiceParams, CreatePriceParams, CreateProductParams,
    CreateScheduleParams, CreateSubscriptionParams, InvoiceListFilter, InvoicePage,
    PaymentMethodInfo, PaymentProvider, ProviderCreditNote, ProviderCustomer, ProviderEvent,
    ProviderInvoice, ProviderSubscription, SetupIntentInfo, TaxCalculation,
    UpdateSubscriptionParams,
};

const DEFAULT_API_BASE: &str = "https://api.stripe.com/";

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Signing secret for `POST /webhooks/stripe`; webhooks are rejected without it
    pub webhook_secret: Option<String>,
    /// Host override (without `/v1`), used against stripe-mock and in tests
    pub api_base: Option<String>,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook deliveries will be rejected");
        }

        let api_base = std::env::var("STRIPE_API_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base,
        })
    }
}

/// Stripe API client handle, cheap to clone
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let base = config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        let inner = stripe::Client::from_url(base, config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Client for a single request, idempotent when a key is supplied
    fn request(&self, idempotency_key: Option<&str>) -> stripe::Client {
        match idempotency_key {
            Some(key) => self
                .inner
                .clone()
                .with_strategy(RequestStrategy::Idempotent(key.to_string())),
            None => self.inner.clone(),
        }
    }
}

/// Map an SDK error into a classified provider error
fn stripe_error(operation: &'static str) -> impl Fn(StripeError) -> BillingError {
    move |err| {
        let kind = match &err {
            StripeError::Stripe(req) => ProviderErrorKind::from_http_status(req.http_status),
            StripeError::Timeout | StripeError::ClientError(_) => ProviderErrorKind::Connection,
            _ => ProviderErrorKind::Other,
        };
        let message = match &err {
            StripeError::Stripe(req) => req
                .message
                .clone()
                .unwrap_or_else(|| format!("HTTP {}", req.http_status)),
            other => other.to_string(),
        };
        BillingError::provider(operation, kind, message)
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> BillingResult<T> {
    raw.parse::<T>()
        .map_err(|_| BillingError::InvalidInput(format!("Invalid {} ID: {}", what, raw)))
}

fn timestamp(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn customer_from_stripe(customer: Customer) -> ProviderCustomer {
    let default_payment_method = customer
        .invoice_settings
        .and_then(|settings| settings.default_payment_method)
        .map(|pm| match pm {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(obj) => obj.id.to_string(),
        });

    ProviderCustomer {
        id: customer.id.to_string(),
        email: customer.email,
        default_payment_method,
    }
}

fn subscription_from_stripe(sub: &Subscription) -> ProviderSubscription {
    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    };
    let first_item = sub.items.data.first();

    ProviderSubscription {
        id: sub.id.to_string(),
        customer_id,
        status: sub.status.to_string(),
        item_id: first_item.map(|item| item.id.to_string()),
        price_id: first_item
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string()),
        current_period_start: timestamp(sub.current_period_start),
        current_period_end: timestamp(sub.current_period_end),
        trial_end: sub.trial_end.map(timestamp),
        created: timestamp(sub.created),
    }
}

// ============================================================================
// Wire types for endpoints called through the generic helpers
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireList<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct WireInvoice {
    id: String,
    #[serde(default)]
    customer: Option<serde_json::Value>,
    #[serde(default)]
    subscription: Option<serde_json::Value>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    amount_due: i64,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    due_date: Option<i64>,
    #[serde(default)]
    hosted_invoice_url: Option<String>,
    #[serde(default)]
    invoice_pdf: Option<String>,
    /// Newer API versions move the subscription under `parent.subscription_details`
    #[serde(default)]
    parent: Option<serde_json::Value>,
}

/// Id of a possibly-expanded reference (`"cus_123"` or `{"id": "cus_123", ...}`)
pub(crate) fn expandable_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Object(map) => map
            .get("id")
            .and_then(|id| id.as_str())
            .map(|id| id.to_string()),
        _ => None,
    }
}

impl From<WireInvoice> for ProviderInvoice {
    fn from(inv: WireInvoice) -> Self {
        ProviderInvoice {
            id: inv.id,
            customer_id: inv.customer.as_ref().and_then(expandable_id),
            subscription_id: inv.subscription.as_ref().and_then(expandable_id).or_else(|| {
                inv.parent
                    .as_ref()
                    .and_then(|parent| parent.pointer("/subscription_details/subscription"))
                    .and_then(expandable_id)
            }),
            number: inv.number,
            status: inv.status,
            currency: inv.currency,
            amount_due: inv.amount_due,
            amount_paid: inv.amount_paid,
            created: inv.created.map(timestamp),
            due_date: inv.due_date.map(timestamp),
            hosted_invoice_url: inv.hosted_invoice_url,
            invoice_pdf: inv.invoice_pdf,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCreditNote {
    id: String,
    #[serde(default)]
    invoice: Option<serde_json::Value>,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<WireCreditNote> for ProviderCreditNote {
    fn from(note: WireCreditNote) -> Self {
        ProviderCreditNote {
            id: note.id,
            invoice_id: note
                .invoice
                .as_ref()
                .and_then(expandable_id)
                .unwrap_or_default(),
            amount: note.amount,
            metadata: note.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCard {
    #[serde(default)]
    brand: String,
    #[serde(default)]
    last4: String,
    #[serde(default)]
    exp_month: i64,
    #[serde(default)]
    exp_year: i64,
}

#[derive(Debug, Deserialize)]
struct WirePaymentMethod {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    customer: Option<serde_json::Value>,
    #[serde(default)]
    card: Option<WireCard>,
}

impl From<WirePaymentMethod> for PaymentMethodInfo {
    fn from(pm: WirePaymentMethod) -> Self {
        PaymentMethodInfo {
            id: pm.id,
            kind: pm.kind,
            customer_id: pm.customer.as_ref().and_then(expandable_id),
            card: pm.card.map(|card| CardInfo {
                brand: card.brand,
                last4: card.last4,
                exp_month: card.exp_month,
                exp_year: card.exp_year,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireSetupIntent {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    customer: Option<serde_json::Value>,
    #[serde(default)]
    payment_method: Option<serde_json::Value>,
}

impl From<WireSetupIntent> for SetupIntentInfo {
    fn from(si: WireSetupIntent) -> Self {
        SetupIntentInfo {
            id: si.id,
            status: si.status,
            client_secret: si.client_secret,
            customer_id: si.customer.as_ref().and_then(expandable_id),
            payment_method_id: si.payment_method.as_ref().and_then(expandable_id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCheckoutSession {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    customer: Option<serde_json::Value>,
    #[serde(default)]
    subscription: Option<serde_json::Value>,
    #[serde(default)]
    setup_intent: Option<serde_json::Value>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<WireCheckoutSession> for CheckoutSessionInfo {
    fn from(session: WireCheckoutSession) -> Self {
        CheckoutSessionInfo {
            id: session.id,
            url: session.url,
            customer_id: session.customer.as_ref().and_then(expandable_id),
            subscription_id: session.subscription.as_ref().and_then(expandable_id),
            setup_intent_id: session.setup_intent.as_ref().and_then(expandable_id),
            metadata: session.metadata,
        }
    }
}

/// Subscription as carried in webhook events. Period bounds moved from the
/// subscription onto its items in newer API versions, so both are read.
#[derive(Debug, Deserialize)]
struct WireSubscription {
    id: String,
    #[serde(default)]
    customer: Option<serde_json::Value>,
    status: String,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    trial_end: Option<i64>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    items: Option<WireList<WireSubscriptionItem>>,
}

#[derive(Debug, Deserialize)]
struct WireSubscriptionItem {
    id: String,
    #[serde(default)]
    price: Option<serde_json::Value>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

/// A subscription event object with its period bounds, which are absent on
/// some payloads
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EventSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub created: Option<OffsetDateTime>,
    pub item_id: Option<String>,
    pub price_id: Option<String>,
}

impl From<WireSubscription> for EventSubscription {
    fn from(sub: WireSubscription) -> Self {
        let first_item = sub.items.and_then(|items| items.data.into_iter().next());
        let item_start = first_item.as_ref().and_then(|item| item.current_period_start);
        let item_end = first_item.as_ref().and_then(|item| item.current_period_end);

        EventSubscription {
            id: sub.id,
            customer_id: sub.customer.as_ref().and_then(expandable_id),
            status: sub.status,
            current_period_start: sub.current_period_start.or(item_start).map(timestamp),
            current_period_end: sub.current_period_end.or(item_end).map(timestamp),
            trial_end: sub.trial_end.map(timestamp),
            created: sub.created.map(timestamp),
            price_id: first_item
                .as_ref()
                .and_then(|item| item.price.as_ref())
                .and_then(expandable_id),
            item_id: first_item.map(|item| item.id),
        }
    }
}

fn decode_object<W, T>(object: &serde_json::Value, what: &str) -> BillingResult<T>
where
    W: serde::de::DeserializeOwned + Into<T>,
{
    W::deserialize(object)
        .map(Into::into)
        .map_err(|e| BillingError::WebhookPayloadInvalid(format!("{} object: {}", what, e)))
}

pub(crate) fn subscription_from_event(object: &serde_json::Value) -> BillingResult<EventSubscription> {
    decode_object::<WireSubscription, _>(object, "subscription")
}

pub(crate) fn invoice_from_event(object: &serde_json::Value) -> BillingResult<ProviderInvoice> {
    decode_object::<WireInvoice, _>(object, "invoice")
}

pub(crate) fn payment_method_from_event(
    object: &serde_json::Value,
) -> BillingResult<PaymentMethodInfo> {
    decode_object::<WirePaymentMethod, _>(object, "payment method")
}

pub(crate) fn checkout_session_from_event(
    object: &serde_json::Value,
) -> BillingResult<CheckoutSessionInfo> {
    decode_object::<WireCheckoutSession, _>(object, "checkout session")
}

#[derive(Debug, Deserialize)]
struct WireObjectId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WirePortalSession {
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireTaxCalculation {
    #[serde(default)]
    id: Option<String>,
    currency: String,
    amount_total: i64,
    #[serde(default)]
    tax_amount_exclusive: i64,
    #[serde(default)]
    tax_amount_inclusive: i64,
}

#[derive(Debug, Deserialize)]
struct WireEmpty {}

// ============================================================================
// Request forms
// ============================================================================

#[derive(Debug, Serialize)]
struct SubscriptionItemForm<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    price: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    quantity: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
struct SubscriptionForm<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    customer: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    items: Vec<SubscriptionItemForm<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_behavior: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proration_behavior: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trial_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct SchedulePhaseItemForm<'a> {
    price: &'a str,
    quantity: u64,
}

#[derive(Debug, Serialize)]
struct SchedulePhaseForm<'a> {
    items: Vec<SchedulePhaseItemForm<'a>>,
    start_date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    proration_behavior: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ScheduleForm<'a> {
    from_subscription: &'a str,
    phases: Vec<SchedulePhaseForm<'a>>,
}

#[derive(Debug, Serialize)]
struct ListInvoicesQuery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    customer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a str>,
    limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    starting_after: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ListCreditNotesQuery<'a> {
    invoice: &'a str,
    limit: u64,
}

#[derive(Debug, Serialize)]
struct CreditNoteForm<'a> {
    invoice: &'a str,
    refund_amount: i64,
    reason: &'a str,
    memo: &'a str,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct InvoiceItemForm<'a> {
    customer: &'a str,
    amount: i64,
    currency: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct InvoiceForm<'a> {
    customer: &'a str,
    collection_method: &'static str,
    due_date: i64,
    pending_invoice_items_behavior: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct AttachForm<'a> {
    customer: &'a str,
}

#[derive(Debug, Serialize)]
struct SetupIntentForm<'a> {
    customer: &'a str,
    usage: &'static str,
    payment_method_types: Vec<&'static str>,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct CheckoutLineItemForm<'a> {
    price: &'a str,
    quantity: u64,
}

#[derive(Debug, Serialize)]
struct CheckoutForm<'a> {
    customer: &'a str,
    mode: &'static str,
    success_url: &'a str,
    cancel_url: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    line_items: Vec<CheckoutLineItemForm<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    payment_method_types: Vec<&'static str>,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct PortalForm<'a> {
    customer: &'a str,
    return_url: &'a str,
}

#[derive(Debug, Serialize)]
struct TaxLineItemForm {
    amount: i64,
    reference: &'static str,
    tax_code: &'static str,
}

#[derive(Debug, Serialize)]
struct TaxCustomerDetailsForm {
    address_source: &'static str,
}

#[derive(Debug, Serialize)]
struct TaxCalculationForm<'a> {
    currency: &'a str,
    customer: &'a str,
    customer_details: TaxCustomerDetailsForm,
    line_items: Vec<TaxLineItemForm>,
}

#[derive(Debug, Serialize)]
struct TaxDefaultsForm<'a> {
    tax_code: &'a str,
}

#[derive(Debug, Serialize)]
struct TaxSettingsForm<'a> {
    defaults: TaxDefaultsForm<'a>,
}

#[derive(Debug, Serialize)]
struct ProductForm<'a> {
    name: &'a str,
    description: &'a str,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct PriceRecurringForm {
    interval: &'static str,
}

#[derive(Debug, Serialize)]
struct PriceForm<'a> {
    product: &'a str,
    unit_amount: i64,
    currency: &'a str,
    recurring: PriceRecurringForm,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Default, Serialize)]
struct NoParams {}

/// Tax code for general electronically supplied services
const SERVICE_TAX_CODE: &str = "txcd_10000000";

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_customer(
        &self,
        email: Option<&str>,
        metadata: HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderCustomer> {
        let params = CreateCustomer {
            email,
            metadata: Some(metadata),
            ..Default::default()
        };
        let customer = Customer::create(&self.request(idempotency_key), params)
            .await
            .map_err(stripe_error("customer.create"))?;
        Ok(customer_from_stripe(customer))
    }

    async fn get_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer> {
        let id: CustomerId = parse_id(customer_id, "customer")?;
        let customer = Customer::retrieve(&self.inner, &id, &[])
            .await
            .map_err(stripe_error("customer.retrieve"))?;
        Ok(customer_from_stripe(customer))
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderCustomer> {
        let id: CustomerId = parse_id(customer_id, "customer")?;
        let params = UpdateCustomer {
            invoice_settings: Some(CustomerInvoiceSettings {
                default_payment_method: Some(payment_method_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let customer = Customer::update(&self.request(idempotency_key), &id, params)
            .await
            .map_err(stripe_error("customer.update"))?;
        Ok(customer_from_stripe(customer))
    }

    async fn create_subscription(
        &self,
        params: &CreateSubscriptionParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderSubscription> {
        let form = SubscriptionForm {
            customer: Some(&params.customer_id),
            items: vec![SubscriptionItemForm {
                id: None,
                price: &params.price_id,
                quantity: Some(1),
            }],
            payment_behavior: Some(params.payment_behavior.as_str()),
            proration_behavior: params.proration_behavior.map(|p| p.as_str()),
            trial_end: params.trial_end.map(|t| t.unix_timestamp()),
            metadata: Some(&params.metadata),
        };
        let sub: Subscription = self
            .request(idempotency_key)
            .post_form("/subscriptions", form)
            .await
            .map_err(stripe_error("subscription.create"))?;
        Ok(subscription_from_stripe(&sub))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: &UpdateSubscriptionParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderSubscription> {
        let items = match params.price_id.as_deref() {
            Some(price) => vec![SubscriptionItemForm {
                id: params.item_id.as_deref(),
                price,
                quantity: None,
            }],
            None => Vec::new(),
        };
        let form = SubscriptionForm {
            customer: None,
            items,
            payment_behavior: params.payment_behavior.map(|p| p.as_str()),
            proration_behavior: params.proration_behavior.map(|p| p.as_str()),
            trial_end: params.trial_end.map(|t| t.unix_timestamp()),
            metadata: params.metadata.as_ref(),
        };
        let sub: Subscription = self
            .request(idempotency_key)
            .post_form(&format!("/subscriptions/{}", subscription_id), form)
            .await
            .map_err(stripe_error("subscription.update"))?;
        Ok(subscription_from_stripe(&sub))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderSubscription> {
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;
        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: Some(false),
            prorate: Some(false),
        };
        let sub = Subscription::cancel(&self.request(idempotency_key), &id, params)
            .await
            .map_err(stripe_error("subscription.cancel"))?;
        Ok(subscription_from_stripe(&sub))
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;
        match Subscription::retrieve(&self.inner, &id, &[]).await {
            Ok(sub) => Ok(Some(subscription_from_stripe(&sub))),
            Err(e) => {
                let err = stripe_error("subscription.retrieve")(e);
                if err.is_provider_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_subscription_schedule(
        &self,
        params: &CreateScheduleParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<String> {
        let form = ScheduleForm {
            from_subscription: &params.from_subscription,
            phases: vec![SchedulePhaseForm {
                items: vec![SchedulePhaseItemForm {
                    price: &params.price_id,
                    quantity: 1,
                }],
                start_date: params.start_date.unix_timestamp(),
                proration_behavior: params.proration_behavior.map(|p| p.as_str()),
            }],
        };
        let schedule: WireObjectId = self
            .request(idempotency_key)
            .post_form("/subscription_schedules", form)
            .await
            .map_err(stripe_error("subscription_schedule.create"))?;
        Ok(schedule.id)
    }

    async fn list_invoices(&self, filter: &InvoiceListFilter) -> BillingResult<InvoicePage> {
        let query = ListInvoicesQuery {
            customer: filter.customer_id.as_deref(),
            subscription: filter.subscription_id.as_deref(),
            status: filter.status.as_deref(),
            limit: filter.limit.clamp(1, 100),
            starting_after: filter.starting_after.as_deref(),
        };
        let list: WireList<WireInvoice> = self
            .inner
            .get_query("/invoices", query)
            .await
            .map_err(stripe_error("invoice.list"))?;
        Ok(InvoicePage {
            invoices: list.data.into_iter().map(ProviderInvoice::from).collect(),
            has_more: list.has_more,
        })
    }

    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice> {
        let invoice: WireInvoice = self
            .inner
            .get(&format!("/invoices/{}", invoice_id))
            .await
            .map_err(stripe_error("invoice.retrieve"))?;
        Ok(invoice.into())
    }

    async fn finalize_invoice(
        &self,
        invoice_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderInvoice> {
        let invoice: WireInvoice = self
            .request(idempotency_key)
            .post_form(
                &format!("/invoices/{}/finalize", invoice_id),
                NoParams::default(),
            )
            .await
            .map_err(stripe_error("invoice.finalize"))?;
        Ok(invoice.into())
    }

    async fn pay_invoice(
        &self,
        invoice_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderInvoice> {
        let invoice: WireInvoice = self
            .request(idempotency_key)
            .post_form(&format!("/invoices/{}/pay", invoice_id), NoParams::default())
            .await
            .map_err(stripe_error("invoice.pay"))?;
        Ok(invoice.into())
    }

    async fn create_invoice_item(
        &self,
        params: &CreateInvoiceItemParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<String> {
        let form = InvoiceItemForm {
            customer: &params.customer_id,
            amount: params.amount,
            currency: &params.currency,
            description: &params.description,
        };
        let item: WireObjectId = self
            .request(idempotency_key)
            .post_form("/invoiceitems", form)
            .await
            .map_err(stripe_error("invoiceitem.create"))?;
        Ok(item.id)
    }

    async fn create_invoice(
        &self,
        params: &CreateInvoiceParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderInvoice> {
        let form = InvoiceForm {
            customer: &params.customer_id,
            collection_method: "send_invoice",
            due_date: params.due_date.unix_timestamp(),
            pending_invoice_items_behavior: "include",
            description: params.description.as_deref(),
        };
        let invoice: WireInvoice = self
            .request(idempotency_key)
            .post_form("/invoices", form)
            .await
            .map_err(stripe_error("invoice.create"))?;
        Ok(invoice.into())
    }

    async fn list_credit_notes(
        &self,
        invoice_id: &str,
        limit: u64,
    ) -> BillingResult<Vec<ProviderCreditNote>> {
        let query = ListCreditNotesQuery {
            invoice: invoice_id,
            limit,
        };
        let list: WireList<WireCreditNote> = self
            .inner
            .get_query("/credit_notes", query)
            .await
            .map_err(stripe_error("credit_note.list"))?;
        Ok(list.data.into_iter().map(ProviderCreditNote::from).collect())
    }

    async fn create_credit_note(
        &self,
        params: &CreateCreditNoteParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<ProviderCreditNote> {
        let form = CreditNoteForm {
            invoice: &params.invoice_id,
            refund_amount: params.refund_amount,
            reason: &params.reason,
            memo: &params.memo,
            metadata: &params.metadata,
        };
        let note: WireCreditNote = self
            .request(idempotency_key)
            .post_form("/credit_notes", form)
            .await
            .map_err(stripe_error("credit_note.create"))?;
        Ok(note.into())
    }

    async fn get_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<PaymentMethodInfo> {
        let pm: WirePaymentMethod = self
            .inner
            .get(&format!("/payment_methods/{}", payment_method_id))
            .await
            .map_err(stripe_error("payment_method.retrieve"))?;
        Ok(pm.into())
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<PaymentMethodInfo> {
        let pm: WirePaymentMethod = self
            .request(idempotency_key)
            .post_form(
                &format!("/payment_methods/{}/attach", payment_method_id),
                AttachForm {
                    customer: customer_id,
                },
            )
            .await
            .map_err(stripe_error("payment_method.attach"))?;
        Ok(pm.into())
    }

    async fn create_setup_intent(
        &self,
        customer_id: &str,
        metadata: HashMap<String, String>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<SetupIntentInfo> {
        let form = SetupIntentForm {
            customer: customer_id,
            usage: "off_session",
            payment_method_types: vec!["card"],
            metadata: &metadata,
        };
        let si: WireSetupIntent = self
            .request(idempotency_key)
            .post_form("/setup_intents", form)
            .await
            .map_err(stripe_error("setup_intent.create"))?;
        Ok(si.into())
    }

    async fn get_setup_intent(&self, setup_intent_id: &str) -> BillingResult<SetupIntentInfo> {
        let si: WireSetupIntent = self
            .inner
            .get(&format!("/setup_intents/{}", setup_intent_id))
            .await
            .map_err(stripe_error("setup_intent.retrieve"))?;
        Ok(si.into())
    }

    async fn create_checkout_session(
        &self,
        params: &CreateCheckoutParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutSessionInfo> {
        let line_items = params
            .price_id
            .as_deref()
            .map(|price| vec![CheckoutLineItemForm { price, quantity: 1 }])
            .unwrap_or_default();
        let payment_method_types = match params.mode {
            crate::provider::CheckoutMode::Setup => vec!["card"],
            crate::provider::CheckoutMode::Subscription => Vec::new(),
        };
        let form = CheckoutForm {
            customer: &params.customer_id,
            mode: params.mode.as_str(),
            success_url: &params.success_url,
            cancel_url: &params.cancel_url,
            line_items,
            payment_method_types,
            metadata: &params.metadata,
        };
        let session: WireCheckoutSession = self
            .request(idempotency_key)
            .post_form("/checkout/sessions", form)
            .await
            .map_err(stripe_error("checkout_session.create"))?;
        Ok(session.into())
    }

    async fn get_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSessionInfo> {
        let session: WireCheckoutSession = self
            .inner
            .get(&format!("/checkout/sessions/{}", session_id))
            .await
            .map_err(stripe_error("checkout_session.retrieve"))?;
        Ok(session.into())
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let session: WirePortalSession = self
            .inner
            .post_form(
                "/billing_portal/sessions",
                PortalForm {
                    customer: customer_id,
                    return_url,
                },
            )
            .await
            .map_err(stripe_error("billing_portal_session.create"))?;
        Ok(session.url)
    }

    async fn calculate_tax(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
    ) -> BillingResult<TaxCalculation> {
        let form = TaxCalculationForm {
            currency,
            customer: customer_id,
            customer_details: TaxCustomerDetailsForm {
                address_source: "billing",
            },
            line_items: vec![TaxLineItemForm {
                amount,
                reference: "service_charge",
                tax_code: SERVICE_TAX_CODE,
            }],
        };
        let calc: WireTaxCalculation = self
            .inner
            .post_form("/tax/calculations", form)
            .await
            .map_err(stripe_error("tax_calculation.create"))?;
        Ok(TaxCalculation {
            id: calc.id,
            currency: calc.currency,
            amount_total: calc.amount_total,
            tax_amount_exclusive: calc.tax_amount_exclusive,
            tax_amount_inclusive: calc.tax_amount_inclusive,
        })
    }

    async fn update_tax_settings(&self, default_tax_code: &str) -> BillingResult<()> {
        let _: WireEmpty = self
            .inner
            .post_form(
                "/tax/settings",
                TaxSettingsForm {
                    defaults: TaxDefaultsForm {
                        tax_code: default_tax_code,
                    },
                },
            )
            .await
            .map_err(stripe_error("tax_settings.update"))?;
        Ok(())
    }

    async fn create_product(
        &self,
        params: &CreateProductParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<String> {
        let product: WireObjectId = self
            .request(idempotency_key)
            .post_form(
                "/products",
                ProductForm {
                    name: &params.name,
                    description: &params.description,
                    metadata: &params.metadata,
                },
            )
            .await
            .map_err(stripe_error("product.create"))?;
        Ok(product.id)
    }

    async fn create_price(
        &self,
        params: &CreatePriceParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<String> {
        let interval = match params.interval {
            BillingCycle::Monthly => "month",
            BillingCycle::Yearly => "year",
        };
        let price: WireObjectId = self
            .request(idempotency_key)
            .post_form(
                "/prices",
                PriceForm {
                    product: &params.product_id,
                    unit_amount: params.unit_amount,
                    currency: &params.currency,
                    recurring: PriceRecurringForm { interval },
                    metadata: &params.metadata,
                },
            )
            .await
            .map_err(stripe_error("price.create"))?;
        Ok(price.id)
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<ProviderEvent> {
        self.inner
            .get(&format!("/events/{}", event_id))
            .await
            .map_err(stripe_error("event.retrieve"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::Server) -> StripeClient {
        StripeClient::new(StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: None,
            api_base: Some(format!("{}/", server.url())),
        })
    }

    #[test]
    fn expandable_id_accepts_string_and_object() {
        assert_eq!(
            expandable_id(&serde_json::json!("cus_1")),
            Some("cus_1".to_string())
        );
        assert_eq!(
            expandable_id(&serde_json::json!({"id": "cus_2", "object": "customer"})),
            Some("cus_2".to_string())
        );
        assert_eq!(expandable_id(&serde_json::json!(null)), None);
    }

    #[tokio::test]
    async fn invoice_retrieve_maps_wire_fields() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/invoices/in_123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"in_123","object":"invoice","customer":"cus_9","subscription":"sub_7",
                    "status":"paid","currency":"aed","amount_due":5000,"amount_paid":5000,
                    "created":1700000000,"hosted_invoice_url":"https://pay.example/in_123",
                    "invoice_pdf":null}"#,
            )
            .create_async()
            .await;

        let invoice = client_for(&server).get_invoice("in_123").await.unwrap();
        assert_eq!(invoice.customer_id.as_deref(), Some("cus_9"));
        assert_eq!(invoice.subscription_id.as_deref(), Some("sub_7"));
        assert_eq!(invoice.amount_paid, 5000);
        assert_eq!(invoice.status.as_deref(), Some("paid"));
        assert!(invoice.invoice_pdf.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/invoices/in_500")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"type":"api_error","message":"try again"}}"#)
            .create_async()
            .await;

        let err = client_for(&server).get_invoice("in_500").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn missing_invoice_is_not_found_and_not_transient() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/invoices/in_missing")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"error":{"type":"invalid_request_error","message":"No such invoice"}}"#,
            )
            .create_async()
            .await;

        let err = client_for(&server)
            .get_invoice("in_missing")
            .await
            .unwrap_err();
        assert!(err.is_provider_not_found());
        assert!(!err.is_transient());
    }
}
