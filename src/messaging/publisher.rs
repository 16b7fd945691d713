use std::sync::Arc;

use super::{Broker, BrokerError, Message, ORDER_CREATED_ROUTING_KEY};
use crate::domain::{DomainEvent, OrderCreatedEvent};
use crate::utils::IsTransient;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker rejected publish: {0}")]
    Broker(#[from] BrokerError),
}

impl IsTransient for PublishError {
    fn is_transient(&self) -> bool {
        match self {
            PublishError::Serialization(_) => false,
            PublishError::Broker(e) => e.is_transient(),
        }
    }
}

/// Serializes order events and hands them to the broker as persistent
/// messages keyed by order id.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Returns once the broker has durably accepted the event.
    pub async fn publish(&self, event: &OrderCreatedEvent) -> Result<(), PublishError> {
        let payload = event.to_payload()?;
        let key = event.aggregate_id().to_string();

        self.publish_raw(ORDER_CREATED_ROUTING_KEY, &key, payload).await?;

        tracing::info!(
            order_id = event.order_id,
            event_type = event.event_type(),
            occurred_at = %event.timestamp(),
            item_count = event.items.len(),
            "Published order event"
        );
        Ok(())
    }

    /// Publishes an already serialized payload, as stored in the outbox.
    pub async fn publish_raw(&self, routing_key: &str, key: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.broker
            .publish(Message::persistent(routing_key, key, payload))
            .await?;
        Ok(())
    }
}
