//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Classification of a failed payment provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Network failure or request timeout
    Connection,
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    Server,
    /// HTTP 404
    NotFound,
    /// HTTP 400 / validation failures
    InvalidRequest,
    /// HTTP 402, card declined and friends
    Card,
    /// HTTP 401 / 403
    Authentication,
    Other,
}

impl ProviderErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Connection | ProviderErrorKind::RateLimited | ProviderErrorKind::Server
        )
    }

    pub fn from_http_status(status: u16) -> Self {
        match status {
            404 => ProviderErrorKind::NotFound,
            429 => ProviderErrorKind::RateLimited,
            401 | 403 => ProviderErrorKind::Authentication,
            402 => ProviderErrorKind::Card,
            400..=499 => ProviderErrorKind::InvalidRequest,
            500..=599 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Concurrent modification, transaction should be retried")]
    ConcurrentModification,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Subscription not found for workspace {0}")]
    SubscriptionNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid proration mode: {0}")]
    InvalidProrationMode(String),

    #[error("Invalid effective date: {0}")]
    InvalidEffectiveDate(String),

    #[error("Plan {0} has not been synced to the payment provider")]
    PlanNotSynced(String),

    #[error("Invalid payment method: {0}")]
    InvalidPaymentMethod(String),

    #[error("Cannot downgrade plan: {reason}")]
    CannotDowngradePlan { reason: String },

    #[error("Subscription is not active (status: {0})")]
    SubscriptionNotActive(String),

    #[error("Subscription is not in trial")]
    SubscriptionNotInTrial,

    #[error("Subscription is not past due")]
    SubscriptionNotPastDue,

    #[error("Outstanding invoices could not be paid: {}", .0.join("; "))]
    OutstandingInvoices(Vec<String>),

    #[error("Invoice is not ready: {0}")]
    InvoiceNotReady(String),

    #[error("Payment provider error during {operation}: {message}")]
    Provider {
        operation: String,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload is malformed: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook secret is not configured")]
    WebhookNotConfigured,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn provider(
        operation: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        BillingError::Provider {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether a retry of the same provider call could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::Provider { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Provider answered 404 for the requested object
    pub fn is_provider_not_found(&self) -> bool {
        matches!(
            self,
            BillingError::Provider {
                kind: ProviderErrorKind::NotFound,
                ..
            }
        )
    }

    /// Machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Database(_) => "database_error",
            BillingError::ConcurrentModification => "concurrent_modification",
            BillingError::NotFound(_) => "not_found",
            BillingError::PlanNotFound(_) => "plan_not_found",
            BillingError::SubscriptionNotFound(_) => "subscription_not_found",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::InvalidProrationMode(_) => "invalid_proration_mode",
            BillingError::InvalidEffectiveDate(_) => "invalid_effective_date",
            BillingError::PlanNotSynced(_) => "plan_not_synced",
            BillingError::InvalidPaymentMethod(_) => "invalid_payment_method",
            BillingError::CannotDowngradePlan { .. } => "cannot_downgrade_plan",
            BillingError::SubscriptionNotActive(_) => "subscription_not_active",
            BillingError::SubscriptionNotInTrial => "subscription_not_in_trial",
            BillingError::SubscriptionNotPastDue => "subscription_not_past_due",
            BillingError::OutstandingInvoices(_) => "outstanding_invoices",
            BillingError::InvoiceNotReady(_) => "invoice_not_ready",
            BillingError::Provider { .. } => "provider_error",
            BillingError::WebhookSignatureInvalid => "webhook_signature_invalid",
            BillingError::WebhookPayloadInvalid(_) => "webhook_payload_invalid",
            BillingError::WebhookNotConfigured => "webhook_not_configured",
            BillingError::Config(_) => "config_error",
            BillingError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // serialization_failure, deadlock_detected, unique_violation
            if matches!(db_err.code().as_deref(), Some("40001" | "40P01" | "23505")) {
                return BillingError::ConcurrentModification;
            }
        }
        BillingError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ProviderErrorKind::from_http_status(503).is_transient());
        assert!(ProviderErrorKind::from_http_status(429).is_transient());
        assert!(!ProviderErrorKind::from_http_status(400).is_transient());
        assert!(!ProviderErrorKind::from_http_status(402).is_transient());
        assert_eq!(
            ProviderErrorKind::from_http_status(404),
            ProviderErrorKind::NotFound
        );
    }

    #[test]
    fn only_provider_errors_are_transient() {
        let err = BillingError::provider("invoice.pay", ProviderErrorKind::Connection, "reset");
        assert!(err.is_transient());
        assert!(!BillingError::ConcurrentModification.is_transient());
        assert!(!BillingError::CannotDowngradePlan {
            reason: "x".into()
        }
        .is_transient());
    }

    #[test]
    fn outstanding_invoices_message_lists_failures() {
        let err = BillingError::OutstandingInvoices(vec![
            "in_1: card_declined".into(),
            "in_2: insufficient_funds".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "Outstanding invoices could not be paid: in_1: card_declined; in_2: insufficient_funds"
        );
    }
}
