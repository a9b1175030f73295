//! Billing notifications
//!
//! Notifications are side effects of committed state changes. They are sent on
//! a spawned task with a deadline, and a failure is only ever logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum BillingNotification {
    Welcome {
        plan_name: String,
    },
    SubscriptionConfirmed {
        plan_name: String,
    },
    PaymentSucceeded {
        amount: i64,
        currency: String,
    },
    PaymentFailed {
        amount: i64,
        currency: String,
    },
    SubscriptionCanceled,
    TrialEnding {
        #[serde(with = "time::serde::rfc3339")]
        trial_end: OffsetDateTime,
    },
}

impl BillingNotification {
    pub fn name(&self) -> &'static str {
        match self {
            BillingNotification::Welcome { .. } => "welcome",
            BillingNotification::SubscriptionConfirmed { .. } => "subscription_confirmed",
            BillingNotification::PaymentSucceeded { .. } => "payment_succeeded",
            BillingNotification::PaymentFailed { .. } => "payment_failed",
            BillingNotification::SubscriptionCanceled => "subscription_canceled",
            BillingNotification::TrialEnding { .. } => "trial_ending",
        }
    }
}

/// Delivery channel for billing notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        workspace_id: Uuid,
        notification: &BillingNotification,
    ) -> BillingResult<()>;
}

/// Fire-and-forget dispatcher in front of a [`Notifier`]
#[derive(Clone)]
pub struct NotificationQueue {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl NotificationQueue {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }

    /// Send in the background. The caller never waits and never sees an error.
    pub fn submit(&self, workspace_id: Uuid, notification: BillingNotification) {
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.timeout;

        tokio::spawn(async move {
            let kind = notification.name();
            match tokio::time::timeout(timeout, notifier.send(workspace_id, &notification)).await
            {
                Ok(Ok(())) => {
                    tracing::debug!(workspace_id = %workspace_id, kind, "Sent billing notification")
                }
                Ok(Err(e)) => tracing::warn!(
                    workspace_id = %workspace_id,
                    kind,
                    error = %e,
                    "Failed to send billing notification"
                ),
                Err(_) => tracing::warn!(
                    workspace_id = %workspace_id,
                    kind,
                    timeout_secs = timeout.as_secs(),
                    "Billing notification timed out"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use tokio::sync::mpsc;

    struct ChannelNotifier(mpsc::UnboundedSender<(Uuid, BillingNotification)>);

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

    struct StuckNotifier;

    #[async_trait]
    impl Notifier for StuckNotifier {
        async fn send(&self, _: Uuid, _: &BillingNotification) -> BillingResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(BillingError::Internal("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn submit_delivers_in_background() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = NotificationQueue::new(Arc::new(ChannelNotifier(tx)), Duration::from_secs(1));
        let ws = Uuid::new_v4();

        queue.submit(ws, BillingNotification::SubscriptionCanceled);

        let (got_ws, got) = rx.recv().await.unwrap();
        assert_eq!(got_ws, ws);
        assert_eq!(got, BillingNotification::SubscriptionCanceled);
    }

    #[tokio::test]
    async fn slow_notifier_does_not_block_submit() {
        let queue = NotificationQueue::new(Arc::new(StuckNotifier), Duration::from_millis(20));
        let started = std::time::Instant::now();
        queue.submit(Uuid::new_v4(), BillingNotification::SubscriptionCanceled);
        assert!(started.elapsed() < Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn notification_serializes_with_template_tag() {
        let json = serde_json::to_value(BillingNotification::PaymentFailed {
            amount: 5499,
            currency: "aed".into(),
        })
        .unwrap();
        assert_eq!(json["template"], "payment_failed");
        assert_eq!(json["amount"], 5499);
    }
}
