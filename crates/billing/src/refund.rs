//! Prorated refunds for canceled subscriptions
//!
//! The refund is issued as a credit note against the latest paid invoice. A
//! credit note carrying the sentinel metadata marks the invoice as already
//! refunded, so redelivered or replayed cancellation events never refund twice.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::proration::{prorated_refund, refund_window_end};
use crate::provider::{CreateCreditNoteParams, InvoiceListFilter, PaymentProvider};
use crate::retry::RetryPolicy;
use crate::store::{BillingStore, RefundRecord};
use crate::subscriptions::SubscriptionRecord;

pub const REFUND_KIND_KEY: &str = "ledgerly_refund_kind";
pub const REFUND_KIND_CANCEL_PRORATED: &str = "cancel_prorated";

const CREDIT_NOTE_REASON: &str = "order_change";
const CREDIT_NOTE_MEMO: &str = "Prorated refund for immediate cancellation";
/// How many recent credit notes are checked for the sentinel
const CREDIT_NOTE_SCAN_LIMIT: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefundOutcome {
    Issued {
        invoice_id: String,
        credit_note_id: String,
        amount: i64,
    },
    AlreadyRefunded {
        invoice_id: String,
    },
    /// No paid invoice, nothing paid, or no time left in the period
    NothingToRefund,
}

#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    retry: RetryPolicy,
}

impl RefundService {
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

    /// Refund the unused part of the current period of `subscription`.
    ///
    /// `period_start` and `period_end` are the provider's nominal bounds for
    /// the period being canceled.
    pub async fn refund_unused_period(
        &self,
        subscription: &SubscriptionRecord,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<RefundOutcome> {
        let provider_sub_id = subscription.provider_subscription_id.as_str();

        let filter = InvoiceListFilter {
            subscription_id: Some(provider_sub_id.to_string()),
            status: Some("paid".to_string()),
            limit: 1,
            ..Default::default()
        };
        let page = self
            .retry
            .run("invoice.list", || self.provider.list_invoices(&filter))
            .await?;

        let Some(invoice) = page.invoices.into_iter().next() else {
            tracing::info!(subscription_id = %provider_sub_id, "No paid invoice to refund");
            return Ok(RefundOutcome::NothingToRefund);
        };
        if invoice.amount_paid <= 0 {
            return Ok(RefundOutcome::NothingToRefund);
        }

        let window_end = refund_window_end(period_end, subscription.current_period_end, now);
        let amount = prorated_refund(invoice.amount_paid, now, period_start, window_end);
        if amount <= 0 {
            tracing::info!(
                subscription_id = %provider_sub_id,
                invoice_id = %invoice.id,
                "No unused time left in the period, skipping refund"
            );
            return Ok(RefundOutcome::NothingToRefund);
        }

        if self.already_refunded(&invoice.id).await {
            tracing::info!(
                subscription_id = %provider_sub_id,
                invoice_id = %invoice.id,
                "Prorated refund already applied, skipping"
            );
            return Ok(RefundOutcome::AlreadyRefunded {
                invoice_id: invoice.id,
            });
        }

        let mut metadata = HashMap::new();
        metadata.insert(
            REFUND_KIND_KEY.to_string(),
            REFUND_KIND_CANCEL_PRORATED.to_string(),
        );
        metadata.insert("subscription".to_string(), provider_sub_id.to_string());
        metadata.insert(
            "workspace_id".to_string(),
            subscription.workspace_id.to_string(),
        );

        let params = CreateCreditNoteParams {
            invoice_id: invoice.id.clone(),
            refund_amount: amount,
            reason: CREDIT_NOTE_REASON.to_string(),
            memo: CREDIT_NOTE_MEMO.to_string(),
            metadata,
        };
        let key = format!("refund_{}", invoice.id);
        let credit_note = self
            .retry
            .run("credit_note.create", || {
                self.provider.create_credit_note(&params, Some(&key))
            })
            .await?;

        tracing::info!(
            workspace_id = %subscription.workspace_id,
            subscription_id = %provider_sub_id,
            invoice_id = %invoice.id,
            credit_note_id = %credit_note.id,
            amount,
            "Issued prorated refund"
        );

        let record = RefundRecord {
            provider_invoice_id: invoice.id.clone(),
            provider_subscription_id: provider_sub_id.to_string(),
            amount,
            credit_note_id: credit_note.id.clone(),
            created_at: now,
        };
        if let Err(e) = self.store.record_refund(&record).await {
            tracing::warn!(
                invoice_id = %invoice.id,
                error = %e,
                "Failed to write refund audit record"
            );
        }

        Ok(RefundOutcome::Issued {
            invoice_id: invoice.id,
            credit_note_id: credit_note.id,
            amount,
        })
    }

    /// Listing failures count as "not refunded"; the credit note's
    /// idempotency key still guards the retry window.
    async fn already_refunded(&self, invoice_id: &str) -> bool {
        match self
            .provider
            .list_credit_notes(invoice_id, CREDIT_NOTE_SCAN_LIMIT)
            .await
        {
            Ok(notes) => notes.iter().any(|note| {
                note.metadata.get(REFUND_KIND_KEY).map(String::as_str)
                    == Some(REFUND_KIND_CANCEL_PRORATED)
            }),
            Err(e) => {
                tracing::warn!(
                    invoice_id = %invoice_id,
                    error = %e,
                    "Credit note listing failed"
                );
                false
            }
        }
    }
}
