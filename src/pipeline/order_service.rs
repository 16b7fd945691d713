use chrono::Utc;
use std::sync::Arc;

use crate::config::PublishMode;
use crate::domain::{NewOrder, Order, OrderCreatedEvent, ValidationError};
use crate::messaging::EventPublisher;
use crate::metrics::Metrics;
use crate::store::{OrderStore, OrderStoreError};

#[derive(Debug, thiserror::Error)]
pub enum OrderServiceError {
    #[error("invalid order: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persistence(#[from] OrderStoreError),
}

/// Order placement: validate, persist, then get the event to the broker.
#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderStore>,
    publisher: EventPublisher,
    mode: PublishMode,
    metrics: Arc<Metrics>,
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        publisher: EventPublisher,
        mode: PublishMode,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            orders,
            publisher,
            mode,
            metrics,
        }
    }

    /// Persists the order with status `pending` and returns it.
    ///
    /// In `Direct` mode the event is published after commit and a publish
    /// failure is only logged: the order stays committed and no event exists
    /// for it. In `Outbox` mode the event row is committed with the order and
    /// delivered later by the relay.
    pub async fn place_order(&self, order: NewOrder) -> Result<Order, OrderServiceError> {
        order.validate()?;

        let with_outbox = self.mode == PublishMode::Outbox;
        let created = self.orders.create(order, with_outbox).await?;
        self.metrics.orders_placed.inc();

        if self.mode == PublishMode::Direct {
            let event = OrderCreatedEvent::from_order(&created, Utc::now());
            if let Err(e) = self.publisher.publish(&event).await {
                self.metrics.record_publish_failure("direct");
                tracing::error!(
                    order_id = created.id,
                    error = %e,
                    "Failed to publish order created event, order has no event"
                );
            }
        }

        Ok(created)
    }

    pub async fn get_order(&self, id: i64) -> Result<Order, OrderServiceError> {
        Ok(self.orders.get_by_id(id).await?)
    }

    pub async fn list_orders(&self, user_id: i64) -> Result<Vec<Order>, OrderServiceError> {
        Ok(self.orders.list_by_user(user_id).await?)
    }
}
