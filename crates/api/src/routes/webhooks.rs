//! Stripe webhook endpoint

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use ledgerly_billing::{webhooks::SIGNATURE_HEADER, BillingError};
use serde_json::json;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// `POST /webhooks/stripe`
///
/// Unauthenticated; the signature over the raw body is the only credential.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = state.billing()?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let outcome = billing
        .webhooks
        .process(&body, signature)
        .await
        .map_err(|e| match e {
            BillingError::WebhookSignatureInvalid
            | BillingError::WebhookPayloadInvalid(_)
            | BillingError::WebhookNotConfigured => ApiError::Billing(e),
            other => ApiError::WebhookHandler(other),
        })?;

    tracing::debug!(outcome = ?outcome, "Webhook delivery acknowledged");
    Ok(Json(json!({ "received": true })))
}
