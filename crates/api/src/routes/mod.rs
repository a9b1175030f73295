//! HTTP routes

pub mod billing;
pub mod webhooks;

use axum::{
    extract::{FromRequestParts, State},
    http::request::Parts,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// Header the upstream auth layer sets to the caller's workspace
pub const WORKSPACE_HEADER: &str = "x-workspace-id";

/// Workspace the request acts on, taken from [`WORKSPACE_HEADER`]
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceId(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for WorkspaceId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(WORKSPACE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        raw.trim()
            .parse()
            .map(WorkspaceId)
            .map_err(|_| ApiError::Validation(format!("Invalid workspace id: {}", raw)))
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .nest("/v1/billing", billing::router())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "billing": state.billing.is_some(),
    }))
}
