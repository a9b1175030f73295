//! Invoice listing, payment, and creation
//!
//! Invoices live at the provider. Locally only their hosted and PDF links are
//! cached, for display.

use std::sync::Arc;

use serde::Serialize;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CreateInvoiceItemParams, CreateInvoiceParams, InvoiceListFilter, PaymentProvider,
    ProviderInvoice,
};
use crate::retry::RetryPolicy;
use crate::store::{BillingStore, InvoiceRecord};
use crate::tax::is_currency_code;

pub const DEFAULT_PAGE_SIZE: usize = 30;
pub const MAX_PAGE_SIZE: usize = 100;
/// Due date for created invoices when the caller gives none
const DEFAULT_DUE_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSummary {
    pub id: String,
    pub number: Option<String>,
    pub status: Option<String>,
    pub currency: Option<String>,
    pub amount_due: i64,
    pub amount_paid: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_invoice_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_pdf: Option<String>,
}

impl From<ProviderInvoice> for InvoiceSummary {
    fn from(invoice: ProviderInvoice) -> Self {
        Self {
            id: invoice.id,
            number: invoice.number,
            status: invoice.status,
            currency: invoice.currency,
            amount_due: invoice.amount_due,
            amount_paid: invoice.amount_paid,
            created_at: invoice.created,
            due_date: invoice.due_date,
            hosted_invoice_url: invoice.hosted_invoice_url,
            invoice_pdf: invoice.invoice_pdf,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceList {
    pub items: Vec<InvoiceSummary>,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

/// Parse an optional `open` / `paid` filter
fn parse_status_filter(status: Option<&str>) -> BillingResult<Option<String>> {
    match status {
        None | Some("") => Ok(None),
        Some(s @ ("open" | "paid")) => Ok(Some(s.to_string())),
        Some(other) => Err(BillingError::InvalidInput(format!(
            "Invalid invoice status filter: {}",
            other
        ))),
    }
}

#[derive(Clone)]
pub struct InvoiceService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    customers: CustomerService,
    retry: RetryPolicy,
}

impl InvoiceService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        customers: CustomerService,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            customers,
            retry,
        }
    }

    /// Page through the workspace's invoices. The provider paginates by cursor,
    /// so earlier pages are walked to reach the requested offset.
    pub async fn list_invoices(
        &self,
        workspace_id: Uuid,
        status: Option<&str>,
        page: usize,
        page_size: usize,
    ) -> BillingResult<InvoiceList> {
        let status = parse_status_filter(status)?;
        let page = page.max(1);
        let page_size = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        let customer = self.customers.ensure_customer(workspace_id, None).await?;

        let offset = (page - 1) * page_size;
        // One extra row tells us whether another page exists
        let target = offset + page_size + 1;
        let mut collected: Vec<ProviderInvoice> = Vec::new();
        let mut starting_after: Option<String> = None;

        while collected.len() < target {
            let filter = InvoiceListFilter {
                customer_id: Some(customer.provider_customer_id.clone()),
                status: status.clone(),
                limit: (target - collected.len()).min(MAX_PAGE_SIZE) as u64,
                starting_after: starting_after.clone(),
                ..Default::default()
            };
            let batch = self
                .retry
                .run("invoice.list", || self.provider.list_invoices(&filter))
                .await?;

            let Some(last) = batch.invoices.last() else {
                break;
            };
            starting_after = Some(last.id.clone());
            let has_more = batch.has_more;
            collected.extend(batch.invoices);
            if !has_more {
                break;
            }
        }

        let has_more = collected.len() > offset + page_size;
        let items: Vec<InvoiceSummary> = collected
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(InvoiceSummary::from)
            .collect();

        for item in &items {
            self.cache_links(
                workspace_id,
                &item.id,
                item.hosted_invoice_url.clone(),
                item.invoice_pdf.clone(),
            )
            .await;
        }

        Ok(InvoiceList {
            items,
            page,
            page_size,
            has_more,
        })
    }

    /// PDF link for an invoice owned by the workspace, else the hosted page
    pub async fn download_url(&self, workspace_id: Uuid, invoice_id: &str) -> BillingResult<String> {
        let invoice = self.owned_invoice(workspace_id, invoice_id).await?;

        if let Some(url) = invoice.invoice_pdf.clone().or(invoice.hosted_invoice_url.clone()) {
            self.cache_links(
                workspace_id,
                &invoice.id,
                invoice.hosted_invoice_url,
                invoice.invoice_pdf,
            )
            .await;
            return Ok(url);
        }

        // The provider omits links on drafts; an earlier finalized copy may be cached
        let cached = self.store.get_invoice_record(workspace_id, invoice_id).await?;
        cached
            .and_then(|record| record.invoice_pdf_url.or(record.hosted_invoice_url))
            .ok_or_else(|| BillingError::InvoiceNotReady(invoice_id.to_string()))
    }

    /// Pay an invoice owned by the workspace, finalizing it first if still a draft
    pub async fn pay_invoice(
        &self,
        workspace_id: Uuid,
        invoice_id: &str,
    ) -> BillingResult<InvoiceSummary> {
        let invoice = self.owned_invoice(workspace_id, invoice_id).await?;

        if invoice.status.as_deref() == Some("draft") {
            let key = format!("finalize_invoice_{}", invoice_id);
            self.retry
                .run("invoice.finalize", || {
                    self.provider.finalize_invoice(invoice_id, Some(&key))
                })
                .await?;
        }

        let key = format!("pay_invoice_{}", invoice_id);
        let paid = self
            .retry
            .run("invoice.pay", || {
                self.provider.pay_invoice(invoice_id, Some(&key))
            })
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            invoice_id = %invoice_id,
            amount_paid = paid.amount_paid,
            "Invoice paid"
        );
        Ok(paid.into())
    }

    /// One-off invoice sent to the customer for `amount` minor units.
    /// `due_date` is `YYYY-MM-DD`; without one the invoice is due in 30 days.
    pub async fn create_invoice(
        &self,
        workspace_id: Uuid,
        amount: i64,
        currency: &str,
        description: &str,
        due_date: Option<&str>,
    ) -> BillingResult<InvoiceSummary> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "amount must be positive".to_string(),
            ));
        }
        if !is_currency_code(currency) {
            return Err(BillingError::InvalidInput(format!(
                "Invalid currency: {}",
                currency
            )));
        }
        let due_date = match due_date {
            Some(raw) => Date::parse(raw, format_description!("[year]-[month]-[day]"))
                .map(|date| date.midnight().assume_utc())
                .map_err(|_| BillingError::InvalidInput(format!("Invalid dueDate: {}", raw)))?,
            None => OffsetDateTime::now_utc() + Duration::days(DEFAULT_DUE_DAYS),
        };

        let customer = self.customers.ensure_customer(workspace_id, None).await?;
        let currency = currency.to_ascii_lowercase();
        // Shared by every retry of this request
        let request_id = Uuid::new_v4();

        let item_params = CreateInvoiceItemParams {
            customer_id: customer.provider_customer_id.clone(),
            amount,
            currency,
            description: description.to_string(),
        };
        let item_key = format!("invoice_item_{}", request_id);
        self.retry
            .run("invoice_item.create", || {
                self.provider
                    .create_invoice_item(&item_params, Some(&item_key))
            })
            .await?;

        let invoice_params = CreateInvoiceParams {
            customer_id: customer.provider_customer_id.clone(),
            description: Some(description.to_string()).filter(|d| !d.is_empty()),
            due_date,
        };
        let invoice_key = format!("invoice_{}", request_id);
        let invoice = self
            .retry
            .run("invoice.create", || {
                self.provider
                    .create_invoice(&invoice_params, Some(&invoice_key))
            })
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            invoice_id = %invoice.id,
            amount,
            "Invoice created"
        );
        Ok(invoice.into())
    }

    /// Cache links for an invoice received from a webhook. Unknown customers
    /// are skipped.
    pub async fn cache_provider_invoice(&self, invoice: &ProviderInvoice) {
        let Some(customer_id) = invoice.customer_id.as_deref() else {
            return;
        };
        match self.store.get_customer_by_provider_id(customer_id).await {
            Ok(Some(customer)) => {
                self.cache_links(
                    customer.workspace_id,
                    &invoice.id,
                    invoice.hosted_invoice_url.clone(),
                    invoice.invoice_pdf.clone(),
                )
                .await
            }
            Ok(None) => tracing::debug!(
                invoice_id = %invoice.id,
                customer_id = %customer_id,
                "No workspace for invoice customer, not caching links"
            ),
            Err(e) => tracing::warn!(
                invoice_id = %invoice.id,
                error = %e,
                "Failed to resolve invoice customer"
            ),
        }
    }

    async fn owned_invoice(
        &self,
        workspace_id: Uuid,
        invoice_id: &str,
    ) -> BillingResult<ProviderInvoice> {
        let customer = self.customers.ensure_customer(workspace_id, None).await?;
        let invoice = match self
            .retry
            .run("invoice.retrieve", || self.provider.get_invoice(invoice_id))
            .await
        {
            Ok(invoice) => invoice,
            Err(e) if e.is_provider_not_found() => {
                return Err(BillingError::NotFound(format!("Invoice {}", invoice_id)))
            }
            Err(e) => return Err(e),
        };

        if invoice.customer_id.as_deref() != Some(customer.provider_customer_id.as_str()) {
            tracing::warn!(
                workspace_id = %workspace_id,
                invoice_id = %invoice_id,
                "Invoice does not belong to workspace"
            );
            return Err(BillingError::NotFound(format!("Invoice {}", invoice_id)));
        }
        Ok(invoice)
    }

    async fn cache_links(
        &self,
        workspace_id: Uuid,
        invoice_id: &str,
        hosted_invoice_url: Option<String>,
        invoice_pdf_url: Option<String>,
    ) {
        if hosted_invoice_url.is_none() && invoice_pdf_url.is_none() {
            return;
        }
        let record = InvoiceRecord {
            workspace_id,
            provider_invoice_id: invoice_id.to_string(),
            hosted_invoice_url,
            invoice_pdf_url,
            updated_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.store.upsert_invoice_record(&record).await {
            tracing::warn!(
                workspace_id = %workspace_id,
                invoice_id = %invoice_id,
                error = %e,
                "Failed to cache invoice links"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_filter_accepts_open_and_paid() {
        assert_eq!(parse_status_filter(None).unwrap(), None);
        assert_eq!(parse_status_filter(Some("")).unwrap(), None);
        assert_eq!(
            parse_status_filter(Some("paid")).unwrap(),
            Some("paid".to_string())
        );
        assert!(matches!(
            parse_status_filter(Some("void")),
            Err(BillingError::InvalidInput(_))
        ));
    }
}
