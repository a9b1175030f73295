//! In-process billing event bus
//!
//! Other domains (onboarding, entitlements) subscribe to react to billing
//! state changes without the billing crate depending on them.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::subscriptions::SubscriptionStatus;

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    /// A checkout session for the workspace completed
    OnboardingPaymentSucceeded { workspace_id: Uuid },
    SubscriptionStatusChanged {
        workspace_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BillingEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BillingEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; having none is not an error
    pub fn publish(&self, event: BillingEvent) {
        match self.sender.send(event) {
            Ok(receivers) => tracing::debug!(receivers, "Published billing event"),
            Err(broadcast::error::SendError(event)) => {
                tracing::debug!(?event, "No subscribers for billing event")
            }
        }
    }
}
