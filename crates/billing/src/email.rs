//! Email delivery for billing notifications
//!
//! Posts a JSON payload to the transactional email service. When no service
//! URL is configured the notification is only logged, which keeps local
//! development and tests free of outbound mail.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::notifications::{BillingNotification, Notifier};

#[derive(Debug, Clone, Default)]
pub struct EmailConfig {
    pub service_url: Option<String>,
    pub service_token: Option<String>,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        let service_url = std::env::var("EMAIL_SERVICE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let service_token = std::env::var("EMAIL_SERVICE_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        if service_url.is_none() {
            tracing::warn!("EMAIL_SERVICE_URL not set, billing emails will only be logged");
        }

        Self {
            service_url,
            service_token,
        }
    }
}

#[derive(Serialize)]
struct EmailRequest<'a> {
    workspace_id: Uuid,
    #[serde(flatten)]
    notification: &'a BillingNotification,
}

#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    config: EmailConfig,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_configured(&self) -> bool {
        self.config.service_url.is_some()
    }
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn send(
        &self,
        workspace_id: Uuid,
        notification: &BillingNotification,
    ) -> BillingResult<()> {
        let Some(url) = self.config.service_url.as_deref() else {
            tracing::info!(
                workspace_id = %workspace_id,
                kind = notification.name(),
                "Email service not configured, skipping billing email"
            );
            return Ok(());
        };

        let mut request = self.http.post(url).json(&EmailRequest {
            workspace_id,
            notification,
        });
        if let Some(token) = &self.config.service_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("Email request failed: {}", e)))?;

        response
            .error_for_status()
            .map_err(|e| BillingError::Internal(format!("Email service rejected request: {}", e)))?;

        tracing::info!(
            workspace_id = %workspace_id,
            kind = notification.name(),
            "Sent billing email"
        );
        Ok(())
    }
}
