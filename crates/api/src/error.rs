//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ledgerly_billing::BillingError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing X-Workspace-Id header")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Billing is not configured")]
    BillingDisabled,

    #[error(transparent)]
    Billing(#[from] BillingError),

    /// A verified webhook whose handler failed; answered with 500 so the
    /// provider redelivers it
    #[error("Webhook handler failed: {0}")]
    WebhookHandler(BillingError),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

/// Status code for a billing error
pub fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::InvalidInput(_)
        | BillingError::InvalidProrationMode(_)
        | BillingError::InvalidEffectiveDate(_)
        | BillingError::PlanNotSynced(_)
        | BillingError::InvalidPaymentMethod(_)
        | BillingError::WebhookSignatureInvalid
        | BillingError::WebhookPayloadInvalid(_) => StatusCode::BAD_REQUEST,

        BillingError::NotFound(_)
        | BillingError::PlanNotFound(_)
        | BillingError::SubscriptionNotFound(_) => StatusCode::NOT_FOUND,

        BillingError::CannotDowngradePlan { .. }
        | BillingError::SubscriptionNotActive(_)
        | BillingError::SubscriptionNotInTrial
        | BillingError::SubscriptionNotPastDue
        | BillingError::OutstandingInvoices(_)
        | BillingError::InvoiceNotReady(_)
        | BillingError::ConcurrentModification => StatusCode::CONFLICT,

        BillingError::Provider { .. } => StatusCode::BAD_GATEWAY,

        BillingError::WebhookNotConfigured => StatusCode::SERVICE_UNAVAILABLE,

        BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::BillingDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Billing(err) => billing_status(err),
            ApiError::WebhookHandler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Validation(_) => "validation_error",
            ApiError::BillingDisabled => "billing_disabled",
            ApiError::Billing(err) => err.code(),
            ApiError::WebhookHandler(_) => "webhook_handler_failed",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side failures are logged in full and answered generically
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, code = self.code(), "Request failed");
            "Internal server error".to_string()
        } else {
            if status.is_server_error() {
                tracing::warn!(error = %self, code = self.code(), "Request failed");
            }
            self.to_string()
        };

        let body = ErrorResponse {
            error: self.code(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerly_billing::ProviderErrorKind;

    #[test]
    fn billing_errors_map_to_status_classes() {
        let cases = [
            (BillingError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (BillingError::PlanNotFound("x".into()), StatusCode::NOT_FOUND),
            (
                BillingError::CannotDowngradePlan { reason: "x".into() },
                StatusCode::CONFLICT,
            ),
            (BillingError::ConcurrentModification, StatusCode::CONFLICT),
            (
                BillingError::provider("invoice.pay", ProviderErrorKind::Card, "declined"),
                StatusCode::BAD_GATEWAY,
            ),
            (BillingError::WebhookNotConfigured, StatusCode::SERVICE_UNAVAILABLE),
            (BillingError::Database("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(billing_status(&err), status, "{:?}", err);
        }
    }

    #[test]
    fn handler_failures_are_server_errors() {
        let err = ApiError::WebhookHandler(BillingError::provider(
            "checkout_session.retrieve",
            ProviderErrorKind::Server,
            "boom",
        ));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "webhook_handler_failed");
    }
}
