// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Lifecycle
//!
//! Drives the services end to end against the in-memory store and a recording
//! payment provider:
//!   - Idempotent create and cancel
//!   - Downgrade guard on feature loss
//!   - Prorated refund on provider deletion, issued once
//!   - Webhook signature, deduplication, and failure recording
//!   - Checkout completion and resume with unpaid invoices
//!   - First payment confirmation versus renewal receipts
//!   - Unit-of-work retry after persistence conflicts

#[cfg(test)]
mod support {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use time::{Duration, OffsetDateTime};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::error::{BillingError, BillingResult, ProviderErrorKind};
    use crate::notifications::{BillingNotification, Notifier};
    use crate::provider::*;
    use crate::store::{BillingStore, MemoryStore};
    use crate::subscriptions::{SubscriptionRecord, SubscriptionStatus};
    use crate::{BillingConfig, BillingService, Plan};

    pub const SECRET: &str = "whsec_edge_case_secret";

    #[derive(Default)]
    pub struct ProviderState {
        pub calls: Vec<String>,
        pub subscriptions: HashMap<String, ProviderSubscription>,
        pub created_by_key: HashMap<String, String>,
        pub invoices: Vec<ProviderInvoice>,
        pub credit_notes: Vec<ProviderCreditNote>,
        pub setup_intents: HashMap<String, SetupIntentInfo>,
        pub checkout_sessions: HashMap<String, CheckoutSessionInfo>,
        pub default_payment_methods: HashMap<String, String>,
        pub failing_payments: HashSet<String>,
        /// Operations that answer with a non-retryable provider error
        pub failing_ops: HashSet<String>,
        next_id: usize,
    }

    impl ProviderState {
        fn next(&mut self, prefix: &str) -> String {
            self.next_id += 1;
            format!("{}_{}", prefix, self.next_id)
        }
    }

    /// Payment provider fake that records every call by operation name
    #[derive(Default)]
    pub struct RecordingProvider {
        pub state: Mutex<ProviderState>,
    }

    impl RecordingProvider {
        pub fn calls(&self, op: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|c| c.as_str() == op)
                .count()
        }

        pub fn total_calls(&self) -> usize {
            self.state.lock().unwrap().calls.len()
        }

        pub fn reset_calls(&self) {
            self.state.lock().unwrap().calls.clear();
        }

        pub fn put_subscription(&self, sub: ProviderSubscription) {
            self.state
                .lock()
                .unwrap()
                .subscriptions
                .insert(sub.id.clone(), sub);
        }

        pub fn put_invoice(&self, invoice: ProviderInvoice) {
            self.state.lock().unwrap().invoices.push(invoice);
        }

        pub fn fail_op(&self, op: &str) {
            self.state.lock().unwrap().failing_ops.insert(op.to_string());
        }

        fn record(&self, op: &str) -> std::sync::MutexGuard<'_, ProviderState> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(op.to_string());
            state
        }

        fn check_failure(state: &ProviderState, op: &str) -> BillingResult<()> {
            if state.failing_ops.contains(op) {
                return Err(BillingError::provider(
                    op,
                    ProviderErrorKind::InvalidRequest,
                    "rejected by test provider",
                ));
            }
            Ok(())
        }
    }

    fn not_found(op: &str, id: &str) -> BillingError {
        BillingError::provider(op, ProviderErrorKind::NotFound, format!("No such object: {}", id))
    }

    pub fn provider_subscription(id: &str, customer_id: &str, status: &str) -> ProviderSubscription {
        let now = OffsetDateTime::now_utc();
        ProviderSubscription {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            status: status.to_string(),
            item_id: Some(format!("si_{}", id)),
            price_id: None,
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            trial_end: None,
            created: now,
        }
    }

    pub fn invoice(id: &str, customer_id: &str, status: &str, amount: i64) -> ProviderInvoice {
        ProviderInvoice {
            id: id.to_string(),
            customer_id: Some(customer_id.to_string()),
            subscription_id: None,
            number: None,
            status: Some(status.to_string()),
            currency: Some("aed".to_string()),
            amount_due: amount,
            amount_paid: if status == "paid" { amount } else { 0 },
            created: Some(OffsetDateTime::now_utc()),
            due_date: None,
            hosted_invoice_url: None,
            invoice_pdf: None,
        }
    }

    #[async_trait]
    impl PaymentProvider for RecordingProvider {
        async fn create_customer(
            &self,
            email: Option<&str>,
            _metadata: HashMap<String, String>,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderCustomer> {
            let mut state = self.record("customer.create");
            Ok(ProviderCustomer {
                id: state.next("cus"),
                email: email.map(str::to_string),
                default_payment_method: None,
            })
        }

        async fn get_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer> {
            let state = self.record("customer.get");
            Ok(ProviderCustomer {
                id: customer_id.to_string(),
                email: None,
                default_payment_method: state.default_payment_methods.get(customer_id).cloned(),
            })
        }

        async fn set_default_payment_method(
            &self,
            customer_id: &str,
            payment_method_id: &str,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderCustomer> {
            let mut state = self.record("customer.set_default_payment_method");
            state
                .default_payment_methods
                .insert(customer_id.to_string(), payment_method_id.to_string());
            Ok(ProviderCustomer {
                id: customer_id.to_string(),
                email: None,
                default_payment_method: Some(payment_method_id.to_string()),
            })
        }

        async fn create_subscription(
            &self,
            params: &CreateSubscriptionParams,
            idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderSubscription> {
            let mut state = self.record("subscription.create");
            if let Some(existing) = idempotency_key
                .and_then(|key| state.created_by_key.get(key))
                .and_then(|id| state.subscriptions.get(id))
            {
                return Ok(existing.clone());
            }

            let id = state.next("sub");
            let status = if params.trial_end.is_some() {
                "trialing"
            } else {
                "active"
            };
            let mut sub = provider_subscription(&id, &params.customer_id, status);
            sub.price_id = Some(params.price_id.clone());
            sub.trial_end = params.trial_end;
            state.subscriptions.insert(id.clone(), sub.clone());
            if let Some(key) = idempotency_key {
                state.created_by_key.insert(key.to_string(), id);
            }
            Ok(sub)
        }

        async fn update_subscription(
            &self,
            subscription_id: &str,
            params: &UpdateSubscriptionParams,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderSubscription> {
            let mut state = self.record("subscription.update");
            let sub = state
                .subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| not_found("subscription.update", subscription_id))?;
            if let Some(price_id) = &params.price_id {
                sub.price_id = Some(price_id.clone());
            }
            if let Some(trial_end) = params.trial_end {
                sub.trial_end = Some(trial_end);
            }
            if params.payment_behavior == Some(PaymentBehavior::AllowIncomplete) {
                sub.status = "active".to_string();
            }
            Ok(sub.clone())
        }

        async fn cancel_subscription(
            &self,
            subscription_id: &str,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderSubscription> {
            let mut state = self.record("subscription.cancel");
            Self::check_failure(&state, "subscription.cancel")?;
            let sub = state
                .subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| not_found("subscription.cancel", subscription_id))?;
            sub.status = "canceled".to_string();
            Ok(sub.clone())
        }

        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<Option<ProviderSubscription>> {
            let state = self.record("subscription.get");
            Ok(state.subscriptions.get(subscription_id).cloned())
        }

        async fn create_subscription_schedule(
            &self,
            _params: &CreateScheduleParams,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<String> {
            let mut state = self.record("subscription_schedule.create");
            Ok(state.next("sub_sched"))
        }

        async fn list_invoices(&self, filter: &InvoiceListFilter) -> BillingResult<InvoicePage> {
            let state = self.record("invoice.list");
            let invoices: Vec<ProviderInvoice> = state
                .invoices
                .iter()
                .filter(|i| {
                    filter.customer_id.is_none() || i.customer_id == filter.customer_id
                })
                .filter(|i| {
                    filter.subscription_id.is_none() || i.subscription_id == filter.subscription_id
                })
                .filter(|i| filter.status.is_none() || i.status == filter.status)
                .take(filter.limit.max(1) as usize)
                .cloned()
                .collect();
            Ok(InvoicePage {
                invoices,
                has_more: false,
            })
        }

        async fn get_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice> {
            let state = self.record("invoice.get");
            state
                .invoices
                .iter()
                .find(|i| i.id == invoice_id)
                .cloned()
                .ok_or_else(|| not_found("invoice.get", invoice_id))
        }

        async fn finalize_invoice(
            &self,
            invoice_id: &str,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderInvoice> {
            let mut state = self.record("invoice.finalize");
            let invoice = state
                .invoices
                .iter_mut()
                .find(|i| i.id == invoice_id)
                .ok_or_else(|| not_found("invoice.finalize", invoice_id))?;
            invoice.status = Some("open".to_string());
            Ok(invoice.clone())
        }

        async fn pay_invoice(
            &self,
            invoice_id: &str,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderInvoice> {
            let mut state = self.record("invoice.pay");
            if state.failing_payments.contains(invoice_id) {
                return Err(BillingError::provider(
                    "invoice.pay",
                    ProviderErrorKind::Card,
                    "Your card was declined.",
                ));
            }
            let invoice = state
                .invoices
                .iter_mut()
                .find(|i| i.id == invoice_id)
                .ok_or_else(|| not_found("invoice.pay", invoice_id))?;
            invoice.status = Some("paid".to_string());
            invoice.amount_paid = invoice.amount_due;
            Ok(invoice.clone())
        }

        async fn create_invoice_item(
            &self,
            _params: &CreateInvoiceItemParams,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<String> {
            let mut state = self.record("invoice_item.create");
            Ok(state.next("ii"))
        }

        async fn create_invoice(
            &self,
            params: &CreateInvoiceParams,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderInvoice> {
            let mut state = self.record("invoice.create");
            let id = state.next("in");
            let mut created = invoice(&id, &params.customer_id, "draft", 0);
            created.due_date = Some(params.due_date);
            state.invoices.push(created.clone());
            Ok(created)
        }

        async fn list_credit_notes(
            &self,
            invoice_id: &str,
            limit: u64,
        ) -> BillingResult<Vec<ProviderCreditNote>> {
            let state = self.record("credit_note.list");
            Ok(state
                .credit_notes
                .iter()
                .filter(|n| n.invoice_id == invoice_id)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn create_credit_note(
            &self,
            params: &CreateCreditNoteParams,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<ProviderCreditNote> {
            let mut state = self.record("credit_note.create");
            let note = ProviderCreditNote {
                id: state.next("cn"),
                invoice_id: params.invoice_id.clone(),
                amount: params.refund_amount,
                metadata: params.metadata.clone(),
            };
            state.credit_notes.push(note.clone());
            Ok(note)
        }

        async fn get_payment_method(
            &self,
            payment_method_id: &str,
        ) -> BillingResult<PaymentMethodInfo> {
            let _state = self.record("payment_method.get");
            Ok(PaymentMethodInfo {
                id: payment_method_id.to_string(),
                kind: "card".to_string(),
                customer_id: None,
                card: Some(CardInfo {
                    brand: "visa".to_string(),
                    last4: "4242".to_string(),
                    exp_month: 12,
                    exp_year: 2030,
                }),
            })
        }

        async fn attach_payment_method(
            &self,
            payment_method_id: &str,
            customer_id: &str,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<PaymentMethodInfo> {
            let _state = self.record("payment_method.attach");
            Ok(PaymentMethodInfo {
                id: payment_method_id.to_string(),
                kind: "card".to_string(),
                customer_id: Some(customer_id.to_string()),
                card: None,
            })
        }

        async fn create_setup_intent(
            &self,
            customer_id: &str,
            _metadata: HashMap<String, String>,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<SetupIntentInfo> {
            let mut state = self.record("setup_intent.create");
            let intent = SetupIntentInfo {
                id: state.next("seti"),
                status: "requires_payment_method".to_string(),
                client_secret: Some("seti_secret".to_string()),
                customer_id: Some(customer_id.to_string()),
                payment_method_id: None,
            };
            state
                .setup_intents
                .insert(intent.id.clone(), intent.clone());
            Ok(intent)
        }

        async fn get_setup_intent(&self, setup_intent_id: &str) -> BillingResult<SetupIntentInfo> {
            let state = self.record("setup_intent.get");
            state
                .setup_intents
                .get(setup_intent_id)
                .cloned()
                .ok_or_else(|| not_found("setup_intent.get", setup_intent_id))
        }

        async fn create_checkout_session(
            &self,
            params: &CreateCheckoutParams,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<CheckoutSessionInfo> {
            let mut state = self.record("checkout_session.create");
            let id = state.next("cs");
            let session = CheckoutSessionInfo {
                url: Some(format!("https://checkout.example/{}", id)),
                id,
                customer_id: Some(params.customer_id.clone()),
                subscription_id: None,
                setup_intent_id: None,
                metadata: params.metadata.clone(),
            };
            state
                .checkout_sessions
                .insert(session.id.clone(), session.clone());
            Ok(session)
        }

        async fn get_checkout_session(
            &self,
            session_id: &str,
        ) -> BillingResult<CheckoutSessionInfo> {
            let state = self.record("checkout_session.retrieve");
            state
                .checkout_sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| not_found("checkout_session.retrieve", session_id))
        }

        async fn create_portal_session(
            &self,
            customer_id: &str,
            _return_url: &str,
        ) -> BillingResult<String> {
            let _state = self.record("portal_session.create");
            Ok(format!("https://billing.example/portal/{}", customer_id))
        }

        async fn calculate_tax(
            &self,
            _customer_id: &str,
            amount: i64,
            currency: &str,
        ) -> BillingResult<TaxCalculation> {
            let _state = self.record("tax_calculation.create");
            let tax = amount / 20;
            Ok(TaxCalculation {
                id: Some("taxcalc_1".to_string()),
                currency: currency.to_string(),
                amount_total: amount + tax,
                tax_amount_exclusive: tax,
                tax_amount_inclusive: 0,
            })
        }

        async fn update_tax_settings(&self, _default_tax_code: &str) -> BillingResult<()> {
            let _state = self.record("tax_settings.update");
            Ok(())
        }

        async fn create_product(
            &self,
            params: &CreateProductParams,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<String> {
            let _state = self.record("product.create");
            Ok(format!("prod_{}", params.name.to_lowercase()))
        }

        async fn create_price(
            &self,
            params: &CreatePriceParams,
            _idempotency_key: Option<&str>,
        ) -> BillingResult<String> {
            let _state = self.record("price.create");
            Ok(format!("price_{}", params.product_id))
        }

        async fn get_event(&self, event_id: &str) -> BillingResult<ProviderEvent> {
            let _state = self.record("event.retrieve");
            Err(not_found("event.retrieve", event_id))
        }
    }

    /// Forwards every notification to a channel the test can await
    pub struct ChannelNotifier(pub mpsc::UnboundedSender<(Uuid, BillingNotification)>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn send(
            &self,
            workspace_id: Uuid,
            notification: &BillingNotification,
        ) -> BillingResult<()> {
            let _ = self.0.send((workspace_id, notification.clone()));
            Ok(())
        }
    }

    pub struct Harness {
        pub billing: BillingService,
        pub store: MemoryStore,
        pub provider: Arc<RecordingProvider>,
        pub notifications: mpsc::UnboundedReceiver<(Uuid, BillingNotification)>,
    }

    impl Harness {
        pub async fn new() -> Self {
            Self::with_secret(Some(SECRET.to_string())).await
        }

        pub async fn with_secret(secret: Option<String>) -> Self {
            let store = MemoryStore::new();
            let provider = Arc::new(RecordingProvider::default());
            let (tx, notifications) = mpsc::unbounded_channel();
            let config = BillingConfig {
                provider_retry_base_ms: 1,
                ..BillingConfig::default()
            };

            let billing = BillingService::new(
                provider.clone(),
                Arc::new(store.clone()),
                Arc::new(ChannelNotifier(tx)),
                config,
                secret,
            );
            billing.plans.seed_catalog().await.unwrap();
            billing.plans.sync_all().await.unwrap();
            provider.reset_calls();

            Self {
                billing,
                store,
                provider,
                notifications,
            }
        }

        pub async fn plan(&self, descriptor: &str) -> Plan {
            self.billing
                .plans
                .get_plan_by_descriptor(descriptor)
                .await
                .unwrap()
        }

        /// Seed a local row, its provider subscription, and the customer mapping
        pub async fn seed_subscription(
            &self,
            descriptor: &str,
            status: SubscriptionStatus,
            provider_status: &str,
        ) -> SubscriptionRecord {
            let workspace_id = Uuid::new_v4();
            let customer_id = format!("cus_{}", workspace_id.simple());
            let sub_id = format!("sub_{}", workspace_id.simple());
            let now = OffsetDateTime::now_utc();

            self.store
                .insert_customer(workspace_id, &customer_id)
                .await
                .unwrap();
            self.provider
                .put_subscription(provider_subscription(&sub_id, &customer_id, provider_status));

            let record = SubscriptionRecord {
                id: Uuid::new_v4(),
                workspace_id,
                plan_id: self.plan(descriptor).await.id,
                provider_subscription_id: sub_id,
                status,
                current_period_end: Some(now + Duration::days(30)),
                created_at: now - Duration::days(40),
                updated_at: now - Duration::days(10),
            };
            self.store.put_subscription(record.clone()).await;
            record
        }

        pub async fn next_notification(&mut self) -> (Uuid, BillingNotification) {
            tokio::time::timeout(StdDuration::from_secs(2), self.notifications.recv())
                .await
                .expect("notification was not sent in time")
                .expect("notification channel closed")
        }
    }

    pub fn signature(payload: &[u8], timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    /// A serialized event and a valid signature header for it
    pub fn signed_event(id: &str, event_type: &str, object: serde_json::Value) -> (Vec<u8>, String) {
        let payload = serde_json::to_vec(&serde_json::json!({
            "id": id,
            "type": event_type,
            "created": OffsetDateTime::now_utc().unix_timestamp(),
            "data": { "object": object },
        }))
        .unwrap();
        let header = signature(&payload, OffsetDateTime::now_utc().unix_timestamp());
        (payload, header)
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::guard::UsageCounts;
    use crate::notifications::BillingNotification;
    use crate::store::BillingStore;
    use crate::subscriptions::SubscriptionStatus;

    // =========================================================================
    // Creating the same subscription twice
    // =========================================================================

    #[tokio::test]
    async fn test_create_twice_is_a_noop() {
        let mut h = Harness::new().await;
        let workspace_id = Uuid::new_v4();
        let plan = h.plan("professional").await;

        let first = h
            .billing
            .subscriptions
            .create_or_update(workspace_id, &plan)
            .await
            .unwrap();
        assert_eq!(first.status, SubscriptionStatus::Active);

        let second = h
            .billing
            .subscriptions
            .create_or_update(workspace_id, &plan)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.provider_subscription_id, second.provider_subscription_id);
        assert_eq!(h.provider.calls("subscription.create"), 1);
        assert_eq!(h.provider.calls("subscription.update"), 0);

        let (notified, notification) = h.next_notification().await;
        assert_eq!(notified, workspace_id);
        assert!(matches!(notification, BillingNotification::Welcome { .. }));
    }

    #[tokio::test]
    async fn test_create_requires_synced_plan() {
        let h = Harness::new().await;
        let mut plan = h.plan("starter").await;
        plan.provider_price_id = None;

        let result = h
            .billing
            .subscriptions
            .create_or_update(Uuid::new_v4(), &plan)
            .await;

        assert!(matches!(result, Err(BillingError::PlanNotSynced(_))));
        assert_eq!(h.provider.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_canceled_row_is_reused_for_new_subscription() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Canceled, "canceled")
            .await;
        let plan = h.plan("starter").await;

        let record = h
            .billing
            .subscriptions
            .create_or_update(seeded.workspace_id, &plan)
            .await
            .unwrap();

        assert_eq!(record.id, seeded.id);
        assert_ne!(record.provider_subscription_id, seeded.provider_subscription_id);
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(h.provider.calls("subscription.create"), 1);
        // A new lifecycle starts its own clock
        assert!(record.created_at > seeded.created_at + Duration::days(39));
    }

    // =========================================================================
    // Plan changes and the downgrade guard
    // =========================================================================

    #[tokio::test]
    async fn test_upgrade_reprices_with_prorations() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        let plan = h.plan("professional").await;

        let record = h
            .billing
            .subscriptions
            .create_or_update(seeded.workspace_id, &plan)
            .await
            .unwrap();

        assert_eq!(record.plan_id, plan.id);
        assert_eq!(record.id, seeded.id);
        assert_eq!(h.provider.calls("subscription.update"), 1);
        assert_eq!(h.provider.calls("subscription.create"), 0);

        let state = h.provider.state.lock().unwrap();
        let sub = &state.subscriptions[&seeded.provider_subscription_id];
        assert_eq!(sub.price_id, plan.provider_price_id);
    }

    #[tokio::test]
    async fn test_downgrade_losing_feature_rejected_without_usage() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("professional", SubscriptionStatus::Active, "active")
            .await;
        h.store
            .set_usage(seeded.workspace_id, UsageCounts::default())
            .await;
        let starter = h.plan("starter").await;

        let result = h
            .billing
            .subscriptions
            .create_or_update(seeded.workspace_id, &starter)
            .await;

        match result {
            Err(BillingError::CannotDowngradePlan { reason }) => {
                assert!(reason.contains("advancedAnalytics"), "reason: {}", reason)
            }
            other => panic!("expected CannotDowngradePlan, got {:?}", other),
        }
        assert_eq!(h.provider.calls("subscription.update"), 0);

        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.plan_id, seeded.plan_id);
    }

    #[tokio::test]
    async fn test_downgrade_of_past_due_subscription_skips_guard() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("professional", SubscriptionStatus::PastDue, "past_due")
            .await;
        let starter = h.plan("starter").await;

        let record = h
            .billing
            .subscriptions
            .create_or_update(seeded.workspace_id, &starter)
            .await
            .unwrap();

        assert_eq!(record.plan_id, starter.id);
        assert_eq!(h.provider.calls("subscription.update"), 1);
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    #[tokio::test]
    async fn test_cancel_already_canceled_makes_no_calls() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Canceled, "canceled")
            .await;

        let record = h
            .billing
            .subscriptions
            .cancel_immediately(seeded.workspace_id)
            .await
            .unwrap();

        assert_eq!(record, seeded);
        assert_eq!(h.provider.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_keeps_period_end_and_notifies() {
        let mut h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;

        let record = h
            .billing
            .subscriptions
            .cancel_immediately(seeded.workspace_id)
            .await
            .unwrap();

        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert_eq!(record.current_period_end, seeded.current_period_end);
        assert_eq!(h.provider.calls("subscription.cancel"), 1);

        let (_, notification) = h.next_notification().await;
        assert_eq!(notification, BillingNotification::SubscriptionCanceled);
    }

    #[tokio::test]
    async fn test_cancel_provider_failure_still_cancels_locally() {
        let mut h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        h.provider.fail_op("subscription.cancel");

        let record = h
            .billing
            .subscriptions
            .cancel_immediately(seeded.workspace_id)
            .await
            .unwrap();

        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert_eq!(h.provider.calls("subscription.cancel"), 1);
        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);

        let (_, notification) = h.next_notification().await;
        assert_eq!(notification, BillingNotification::SubscriptionCanceled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_workspace_is_not_found() {
        let h = Harness::new().await;
        let result = h
            .billing
            .subscriptions
            .cancel_immediately(Uuid::new_v4())
            .await;
        assert!(matches!(result, Err(BillingError::SubscriptionNotFound(_))));
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    #[tokio::test]
    async fn test_schedule_rejects_bad_input_before_provider_calls() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        let plan = h.plan("professional").await;
        let subs = &h.billing.subscriptions;

        let bad_mode = subs
            .schedule_change(seeded.workspace_id, &plan, "2030-01-01", "sometimes")
            .await;
        assert!(matches!(bad_mode, Err(BillingError::InvalidProrationMode(_))));

        let bad_date = subs
            .schedule_change(seeded.workspace_id, &plan, "01/01/2030", "none")
            .await;
        assert!(matches!(bad_date, Err(BillingError::InvalidEffectiveDate(_))));

        assert_eq!(h.provider.total_calls(), 0);

        let schedule_id = subs
            .schedule_change(seeded.workspace_id, &plan, "2030-01-01", "")
            .await
            .unwrap();
        assert!(schedule_id.starts_with("sub_sched"));
        assert_eq!(h.provider.calls("subscription_schedule.create"), 1);
    }

    // =========================================================================
    // Trials and grace periods
    // =========================================================================

    #[tokio::test]
    async fn test_trial_extension_requires_trialing_subscription() {
        let h = Harness::new().await;
        let plan = h.plan("starter").await;
        let workspace_id = Uuid::new_v4();
        let subs = &h.billing.subscriptions;

        let record = subs.create_trial(workspace_id, &plan, 14).await.unwrap();
        assert_eq!(record.status, SubscriptionStatus::Trialing);

        let before = subs.check_trial_status(workspace_id).await.unwrap();
        assert!(before.is_in_trial);

        let after = subs.extend_trial(workspace_id, 7).await.unwrap();
        assert!(after.trial_end > before.trial_end);

        let again = subs.create_trial(workspace_id, &plan, 14).await;
        assert!(matches!(again, Err(BillingError::InvalidInput(_))));

        let active = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        let result = subs.extend_trial(active.workspace_id, 7).await;
        assert!(matches!(result, Err(BillingError::SubscriptionNotInTrial)));
    }

    #[tokio::test]
    async fn test_grace_period_requires_past_due() {
        let h = Harness::new().await;
        let subs = &h.billing.subscriptions;

        let active = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        let result = subs.handle_grace_period(active.workspace_id, 5).await;
        assert!(matches!(result, Err(BillingError::SubscriptionNotPastDue)));

        let past_due = h
            .seed_subscription("starter", SubscriptionStatus::PastDue, "past_due")
            .await;
        let grace_end = subs.handle_grace_period(past_due.workspace_id, 5).await.unwrap();
        let expected = OffsetDateTime::now_utc() + Duration::days(5);
        assert!((grace_end - expected).abs() < Duration::minutes(1));

        let out_of_range = subs.handle_grace_period(past_due.workspace_id, 31).await;
        assert!(matches!(out_of_range, Err(BillingError::InvalidInput(_))));
    }

    // =========================================================================
    // Persistence conflicts
    // =========================================================================

    #[tokio::test]
    async fn test_unit_of_work_retries_after_conflict() {
        let h = Harness::new().await;
        let workspace_id = Uuid::new_v4();
        let plan = h.plan("starter").await;
        h.store.inject_commit_conflicts(1);

        let record = h
            .billing
            .subscriptions
            .create_or_update(workspace_id, &plan)
            .await
            .unwrap();

        assert_eq!(record.status, SubscriptionStatus::Active);
        // The retried provider call reused its idempotency key
        assert_eq!(h.provider.state.lock().unwrap().subscriptions.len(), 1);

        let stored = h.store.get_subscription(workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.id, record.id);
    }

    #[tokio::test]
    async fn test_unit_of_work_gives_up_after_retry_budget() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        h.store.inject_commit_conflicts(10);

        let result = h
            .billing
            .subscriptions
            .cancel_immediately(seeded.workspace_id)
            .await;

        assert!(matches!(result, Err(BillingError::ConcurrentModification)));
        h.store.inject_commit_conflicts(0);
        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
    }
}

#[cfg(test)]
mod resume_tests {
    use super::support::*;
    use crate::error::BillingError;
    use crate::store::BillingStore;
    use crate::subscriptions::SubscriptionStatus;

    // =========================================================================
    // Resume with outstanding invoices
    // =========================================================================

    #[tokio::test]
    async fn test_resume_aborts_when_invoice_payment_fails() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::PastDue, "past_due")
            .await;
        let customer = h.store.get_customer(seeded.workspace_id).await.unwrap().unwrap();

        h.provider
            .put_invoice(invoice("in_open", &customer.provider_customer_id, "open", 4900));
        h.provider
            .state
            .lock()
            .unwrap()
            .failing_payments
            .insert("in_open".to_string());

        let result = h
            .billing
            .subscriptions
            .resume_if_no_due(seeded.workspace_id)
            .await;

        match result {
            Err(BillingError::OutstandingInvoices(failures)) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("in_open"));
            }
            other => panic!("expected OutstandingInvoices, got {:?}", other),
        }
        assert_eq!(h.provider.calls("subscription.update"), 0);

        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_resume_finalizes_drafts_then_reactivates() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::PastDue, "past_due")
            .await;
        let customer = h.store.get_customer(seeded.workspace_id).await.unwrap().unwrap();
        h.provider
            .put_invoice(invoice("in_draft", &customer.provider_customer_id, "draft", 4900));

        let record = h
            .billing
            .subscriptions
            .resume_if_no_due(seeded.workspace_id)
            .await
            .unwrap();

        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(h.provider.calls("invoice.finalize"), 1);
        assert_eq!(h.provider.calls("invoice.pay"), 1);
        assert_eq!(h.provider.calls("subscription.update"), 1);
    }

    #[tokio::test]
    async fn test_resume_recreates_missing_provider_subscription() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::PastDue, "past_due")
            .await;
        h.provider
            .state
            .lock()
            .unwrap()
            .subscriptions
            .remove(&seeded.provider_subscription_id);

        let record = h
            .billing
            .subscriptions
            .resume_if_no_due(seeded.workspace_id)
            .await
            .unwrap();

        assert_eq!(h.provider.calls("subscription.create"), 1);
        assert_ne!(record.provider_subscription_id, seeded.provider_subscription_id);
        assert_eq!(record.status, SubscriptionStatus::Active);
    }
}

#[cfg(test)]
mod refund_tests {
    use std::collections::HashMap;

    use time::{Duration, OffsetDateTime};

    use super::support::*;
    use crate::provider::ProviderCreditNote;
    use crate::refund::{REFUND_KIND_CANCEL_PRORATED, REFUND_KIND_KEY};
    use crate::store::BillingStore;
    use crate::subscriptions::{SubscriptionRecord, SubscriptionStatus};
    use crate::webhooks::WebhookOutcome;

    struct Deleted {
        record: SubscriptionRecord,
        payload: Vec<u8>,
        header: String,
    }

    /// Active subscription 10 days into a 30 day period, paid 5000, and a
    /// signed deletion event for it
    async fn deleted_mid_period(h: &Harness, event_id: &str) -> Deleted {
        let mut record = h
            .seed_subscription("professional", SubscriptionStatus::Active, "active")
            .await;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let start = now - Duration::days(10).whole_seconds();
        let end = now + Duration::days(20).whole_seconds();
        record.current_period_end = Some(OffsetDateTime::from_unix_timestamp(end).unwrap());
        h.store.put_subscription(record.clone()).await;

        let mut paid = invoice("in_paid", "cus_any", "paid", 5000);
        paid.subscription_id = Some(record.provider_subscription_id.clone());
        h.provider.put_invoice(paid);

        let (payload, header) = signed_event(
            event_id,
            "customer.subscription.deleted",
            serde_json::json!({
                "id": record.provider_subscription_id,
                "object": "subscription",
                "customer": "cus_any",
                "status": "canceled",
                "current_period_start": start,
                "current_period_end": end,
                "created": start,
            }),
        );
        Deleted {
            record,
            payload,
            header,
        }
    }

    // =========================================================================
    // Prorated refund on deletion
    // =========================================================================

    #[tokio::test]
    async fn test_deletion_refunds_unused_two_thirds() {
        let mut h = Harness::new().await;
        let deleted = deleted_mid_period(&h, "evt_deleted").await;

        let outcome = h
            .billing
            .webhooks
            .process(&deleted.payload, &deleted.header)
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        {
            let state = h.provider.state.lock().unwrap();
            assert_eq!(state.credit_notes.len(), 1);
            let note = &state.credit_notes[0];
            assert_eq!(note.invoice_id, "in_paid");
            assert_eq!(note.amount, 3333);
            assert_eq!(
                note.metadata.get(REFUND_KIND_KEY).map(String::as_str),
                Some(REFUND_KIND_CANCEL_PRORATED)
            );
        }

        let stored = h
            .store
            .get_subscription(deleted.record.workspace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);

        let refunds = h.store.refunds().await;
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, 3333);

        let (workspace_id, notification) = h.next_notification().await;
        assert_eq!(workspace_id, deleted.record.workspace_id);
        assert_eq!(notification, crate::BillingNotification::SubscriptionCanceled);
    }

    #[tokio::test]
    async fn test_existing_sentinel_prevents_second_refund() {
        let h = Harness::new().await;
        let deleted = deleted_mid_period(&h, "evt_deleted_again").await;

        let mut metadata = HashMap::new();
        metadata.insert(
            REFUND_KIND_KEY.to_string(),
            REFUND_KIND_CANCEL_PRORATED.to_string(),
        );
        h.provider
            .state
            .lock()
            .unwrap()
            .credit_notes
            .push(ProviderCreditNote {
                id: "cn_earlier".to_string(),
                invoice_id: "in_paid".to_string(),
                amount: 3333,
                metadata,
            });

        h.billing
            .webhooks
            .process(&deleted.payload, &deleted.header)
            .await
            .unwrap();

        assert_eq!(h.provider.calls("credit_note.create"), 0);
        assert_eq!(h.provider.state.lock().unwrap().credit_notes.len(), 1);

        let stored = h
            .store
            .get_subscription(deleted.record.workspace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
    }
}

#[cfg(test)]
mod webhook_tests {
    use std::collections::HashMap;

    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::events::BillingEvent;
    use crate::notifications::BillingNotification;
    use crate::provider::{CheckoutSessionInfo, SetupIntentInfo};
    use crate::store::BillingStore;
    use crate::subscriptions::{SubscriptionRecord, SubscriptionStatus};
    use crate::webhooks::WebhookOutcome;

    fn subscription_object(id: &str, status: &str) -> serde_json::Value {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        serde_json::json!({
            "id": id,
            "object": "subscription",
            "customer": "cus_any",
            "status": status,
            "current_period_start": now,
            "current_period_end": now + 30 * 86_400,
            "created": now,
        })
    }

    // =========================================================================
    // Signature verification
    // =========================================================================

    #[tokio::test]
    async fn test_missing_secret_fails_closed() {
        let h = Harness::with_secret(None).await;
        let (payload, header) = signed_event("evt_1", "invoice.finalized", serde_json::json!({}));

        let result = h.billing.webhooks.process(&payload, &header).await;

        assert!(matches!(result, Err(BillingError::WebhookNotConfigured)));
        assert_eq!(h.store.webhook_event_count().await, 0);
    }

    #[tokio::test]
    async fn test_signature_mismatch_rejected() {
        let h = Harness::new().await;
        let (payload, _) = signed_event("evt_1", "invoice.finalized", serde_json::json!({}));
        let header = signature(b"something else", OffsetDateTime::now_utc().unix_timestamp());

        let result = h.billing.webhooks.process(&payload, &header).await;

        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
        assert_eq!(h.store.webhook_event_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let h = Harness::new().await;
        let (payload, _) = signed_event("evt_1", "invoice.finalized", serde_json::json!({}));
        let header = signature(&payload, OffsetDateTime::now_utc().unix_timestamp() - 600);

        let result = h.billing.webhooks.process(&payload, &header).await;

        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    // =========================================================================
    // Deduplication and recording
    // =========================================================================

    #[tokio::test]
    async fn test_duplicate_delivery_handled_once() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        let (payload, header) = signed_event(
            "evt_dup",
            "customer.subscription.updated",
            subscription_object(&seeded.provider_subscription_id, "past_due"),
        );

        let first = h.billing.webhooks.process(&payload, &header).await.unwrap();
        let second = h.billing.webhooks.process(&payload, &header).await.unwrap();

        assert_eq!(first, WebhookOutcome::Processed);
        assert_eq!(second, WebhookOutcome::Duplicate);
        assert_eq!(h.store.webhook_event_count().await, 1);

        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_unknown_event_ignored_and_recorded() {
        let h = Harness::new().await;
        let (payload, header) =
            signed_event("evt_unknown", "customer.discount.created", serde_json::json!({}));

        let outcome = h.billing.webhooks.process(&payload, &header).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(h.store.webhook_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_handler_is_not_recorded() {
        let h = Harness::new().await;
        let (payload, header) = signed_event(
            "evt_checkout_missing",
            "checkout.session.completed",
            serde_json::json!({ "id": "cs_missing", "object": "checkout.session" }),
        );

        let result = h.billing.webhooks.process(&payload, &header).await;

        assert!(result.is_err());
        assert_eq!(h.store.webhook_event_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_rejected_after_verification() {
        let h = Harness::new().await;
        let payload = br#"{"not":"an event"}"#;
        let header = signature(payload, OffsetDateTime::now_utc().unix_timestamp());

        let result = h.billing.webhooks.process(payload, &header).await;

        assert!(matches!(result, Err(BillingError::WebhookPayloadInvalid(_))));
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    #[tokio::test]
    async fn test_disallowed_transition_leaves_status() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        let (payload, header) = signed_event(
            "evt_backwards",
            "customer.subscription.updated",
            subscription_object(&seeded.provider_subscription_id, "incomplete"),
        );

        let outcome = h.billing.webhooks.process(&payload, &header).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_payment_failure_marks_past_due_and_notifies() {
        let mut h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        let (payload, header) = signed_event(
            "evt_failed",
            "invoice.payment_failed",
            serde_json::json!({
                "id": "in_failed",
                "object": "invoice",
                "customer": "cus_any",
                "subscription": seeded.provider_subscription_id,
                "status": "open",
                "currency": "aed",
                "amount_due": 4900,
                "amount_paid": 0,
            }),
        );

        h.billing.webhooks.process(&payload, &header).await.unwrap();

        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);

        let (workspace_id, notification) = h.next_notification().await;
        assert_eq!(workspace_id, seeded.workspace_id);
        assert_eq!(
            notification,
            BillingNotification::PaymentFailed {
                amount: 4900,
                currency: "aed".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_checkout_completion_sets_default_card_and_activates() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Incomplete, "incomplete")
            .await;
        let customer = h.store.get_customer(seeded.workspace_id).await.unwrap().unwrap();
        let customer_id = customer.provider_customer_id.clone();

        {
            let mut state = h.provider.state.lock().unwrap();
            state.setup_intents.insert(
                "seti_done".to_string(),
                SetupIntentInfo {
                    id: "seti_done".to_string(),
                    status: "succeeded".to_string(),
                    client_secret: None,
                    customer_id: Some(customer_id.clone()),
                    payment_method_id: Some("pm_card1".to_string()),
                },
            );
            state.checkout_sessions.insert(
                "cs_done".to_string(),
                CheckoutSessionInfo {
                    id: "cs_done".to_string(),
                    url: None,
                    customer_id: Some(customer_id.clone()),
                    subscription_id: Some(seeded.provider_subscription_id.clone()),
                    setup_intent_id: Some("seti_done".to_string()),
                    metadata: HashMap::new(),
                },
            );
        }
        let mut events = h.billing.events.subscribe();

        let (payload, header) = signed_event(
            "evt_checkout",
            "checkout.session.completed",
            serde_json::json!({ "id": "cs_done", "object": "checkout.session" }),
        );
        let outcome = h.billing.webhooks.process(&payload, &header).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        assert_eq!(h.provider.calls("payment_method.attach"), 1);
        assert_eq!(
            h.provider
                .state
                .lock()
                .unwrap()
                .default_payment_methods
                .get(&customer_id)
                .map(String::as_str),
            Some("pm_card1")
        );
        let customer = h.store.get_customer(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(customer.default_payment_method_id.as_deref(), Some("pm_card1"));

        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);

        let mut onboarding_seen = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (BillingEvent::OnboardingPaymentSucceeded {
                    workspace_id: seeded.workspace_id,
                })
            {
                onboarding_seen = true;
            }
        }
        assert!(onboarding_seen);
    }

    #[tokio::test]
    async fn test_checkout_completion_uses_session_customer_when_intent_has_none() {
        let h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Active, "active")
            .await;
        let customer_id = h
            .store
            .get_customer(seeded.workspace_id)
            .await
            .unwrap()
            .unwrap()
            .provider_customer_id;

        {
            let mut state = h.provider.state.lock().unwrap();
            state.setup_intents.insert(
                "seti_bare".to_string(),
                SetupIntentInfo {
                    id: "seti_bare".to_string(),
                    status: "succeeded".to_string(),
                    client_secret: None,
                    customer_id: None,
                    payment_method_id: Some("pm_card2".to_string()),
                },
            );
            state.checkout_sessions.insert(
                "cs_setup".to_string(),
                CheckoutSessionInfo {
                    id: "cs_setup".to_string(),
                    url: None,
                    customer_id: Some(customer_id.clone()),
                    subscription_id: None,
                    setup_intent_id: Some("seti_bare".to_string()),
                    metadata: HashMap::new(),
                },
            );
        }

        let (payload, header) = signed_event(
            "evt_checkout_setup",
            "checkout.session.completed",
            serde_json::json!({ "id": "cs_setup", "object": "checkout.session" }),
        );
        let outcome = h.billing.webhooks.process(&payload, &header).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(h.provider.calls("payment_method.attach"), 1);
        assert_eq!(
            h.provider
                .state
                .lock()
                .unwrap()
                .default_payment_methods
                .get(&customer_id)
                .map(String::as_str),
            Some("pm_card2")
        );
        let customer = h.store.get_customer(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(customer.default_payment_method_id.as_deref(), Some("pm_card2"));
    }

    fn paid_invoice(subscription_id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": format!("in_paid_{}", subscription_id),
            "object": "invoice",
            "customer": "cus_any",
            "subscription": subscription_id,
            "status": "paid",
            "currency": "aed",
            "amount_due": 4900,
            "amount_paid": 4900,
        })
    }

    #[tokio::test]
    async fn test_first_payment_confirms_subscription() {
        let mut h = Harness::new().await;
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::Incomplete, "incomplete")
            .await;
        let fresh = SubscriptionRecord {
            created_at: OffsetDateTime::now_utc() - Duration::hours(1),
            ..seeded.clone()
        };
        h.store.put_subscription(fresh).await;
        let plan = h.plan("starter").await;

        let (payload, header) = signed_event(
            "evt_first_payment",
            "invoice.payment_succeeded",
            paid_invoice(&seeded.provider_subscription_id),
        );
        h.billing.webhooks.process(&payload, &header).await.unwrap();

        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        let (workspace_id, notification) = h.next_notification().await;
        assert_eq!(workspace_id, seeded.workspace_id);
        assert_eq!(
            notification,
            BillingNotification::SubscriptionConfirmed {
                plan_name: plan.name,
            }
        );
    }

    #[tokio::test]
    async fn test_renewal_payment_reports_amount() {
        let mut h = Harness::new().await;
        // Seeded rows were created 40 days ago
        let seeded = h
            .seed_subscription("starter", SubscriptionStatus::PastDue, "past_due")
            .await;

        let (payload, header) = signed_event(
            "evt_renewal",
            "invoice.payment_succeeded",
            paid_invoice(&seeded.provider_subscription_id),
        );
        h.billing.webhooks.process(&payload, &header).await.unwrap();

        let stored = h.store.get_subscription(seeded.workspace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        let (workspace_id, notification) = h.next_notification().await;
        assert_eq!(workspace_id, seeded.workspace_id);
        assert_eq!(
            notification,
            BillingNotification::PaymentSucceeded {
                amount: 4900,
                currency: "aed".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_event_for_unknown_subscription_is_processed() {
        let h = Harness::new().await;
        let (payload, header) = signed_event(
            "evt_orphan",
            "customer.subscription.updated",
            subscription_object(&format!("sub_{}", Uuid::new_v4().simple()), "active"),
        );

        let outcome = h.billing.webhooks.process(&payload, &header).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(h.store.webhook_event_count().await, 1);
    }
}
