use kameo::actor::ActorRef;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::config::{ConsumerConfig, ReservationFailurePolicy, ReservationStrategy};
use crate::domain::{OrderCreatedEvent, ValidationError};
use crate::health::{HealthMonitorActor, HealthStatus, UpdateHealth};
use crate::messaging::{Broker, BrokerError, Delivery};
use crate::metrics::Metrics;
use crate::store::{InventoryError, InventoryStore, OrderStore, Reservation};
use crate::utils::{retry_on_transient, IsTransient, RetryConfig};

use super::compensation::compensate_order;

// ============================================================================
// Stock Consumer - turns order created events into stock reservations
// ============================================================================
//
// Per delivery:
//   decode -> validate -> apply (strategy) -> ack
//
// On failure the redelivery policy decides between requeue and dead-letter.
// A dead-lettered order is compensated according to the failure policy.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("undecodable event payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("product {0} not found")]
    NotFound(i64),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: i64,
        requested: i32,
        available: i32,
    },

    #[error("inventory unavailable: {0}")]
    Infrastructure(String),

    #[error("handling exceeded {0:?}")]
    Timeout(Duration),
}

impl ConsumeError {
    /// Label used in metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ConsumeError::Decode(_) => "decode",
            ConsumeError::Validation(_) => "validation",
            ConsumeError::NotFound(_) => "not_found",
            ConsumeError::InsufficientStock { .. } => "insufficient_stock",
            ConsumeError::Infrastructure(_) => "infrastructure",
            ConsumeError::Timeout(_) => "timeout",
        }
    }
}

impl IsTransient for ConsumeError {
    /// A malformed event never becomes valid. Everything else may succeed on
    /// a later delivery (product created, stock replenished, database back).
    fn is_transient(&self) -> bool {
        !matches!(self, ConsumeError::Decode(_) | ConsumeError::Validation(_))
    }
}

impl From<InventoryError> for ConsumeError {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::NotFound(id) => ConsumeError::NotFound(id),
            InventoryError::InsufficientStock {
                product_id,
                requested,
                available,
            } => ConsumeError::InsufficientStock {
                product_id,
                requested,
                available,
            },
            InventoryError::Invalid(e) => ConsumeError::Validation(e),
            InventoryError::Database(e) => ConsumeError::Infrastructure(e.to_string()),
        }
    }
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Acked without changes; the order had already been reserved.
    Duplicate,
    Requeued,
    DeadLettered,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::Duplicate => "duplicate",
            Disposition::Requeued => "requeued",
            Disposition::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Clone)]
pub struct StockConsumer {
    broker: Arc<dyn Broker>,
    inventory: Arc<dyn InventoryStore>,
    orders: Option<Arc<dyn OrderStore>>,
    config: ConsumerConfig,
    metrics: Arc<Metrics>,
    health: Option<ActorRef<HealthMonitorActor>>,
}

impl StockConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        inventory: Arc<dyn InventoryStore>,
        config: ConsumerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            broker,
            inventory,
            orders: None,
            config,
            metrics,
            health: None,
        }
    }

    /// Order store used to compensate dead-lettered orders.
    pub fn with_order_store(mut self, orders: Arc<dyn OrderStore>) -> Self {
        self.orders = Some(orders);
        self
    }

    pub fn with_health(mut self, health: ActorRef<HealthMonitorActor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Same stores and policies, different broker handle. Used to give each
    /// worker its own consumer-group member.
    pub fn with_broker(&self, broker: Arc<dyn Broker>) -> Self {
        let mut consumer = self.clone();
        consumer.broker = broker;
        consumer
    }

    fn strategy_label(&self) -> &'static str {
        match self.config.strategy {
            ReservationStrategy::Sequential => "sequential",
            ReservationStrategy::Atomic => "atomic",
        }
    }

    /// Handles one delivery to completion and settles it with the broker.
    ///
    /// Only a broker error while settling is returned; every processing
    /// failure is turned into a requeue or a dead-letter.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<Disposition, BrokerError> {
        let started = Instant::now();
        self.metrics.events_received.inc();

        let (order_id, outcome) = match OrderCreatedEvent::from_payload(delivery.payload()) {
            Ok(event) => (Some(event.order_id), self.apply_with_timeout(&event).await),
            Err(e) => (None, Err(ConsumeError::Decode(e))),
        };

        let disposition = match outcome {
            Ok(reservation) => {
                self.broker.ack(delivery).await?;
                if reservation == Reservation::AlreadyApplied {
                    Disposition::Duplicate
                } else {
                    tracing::info!(
                        order_id = ?order_id,
                        delivery_count = delivery.delivery_count(),
                        "Stock reserved, event acknowledged"
                    );
                    Disposition::Acked
                }
            }
            Err(err) => {
                self.metrics.record_failure(err.reason());
                self.settle_failure(delivery, order_id, err).await?
            }
        };

        self.metrics
            .record_outcome(disposition.as_str(), self.strategy_label(), started.elapsed().as_secs_f64());
        Ok(disposition)
    }

    async fn apply_with_timeout(&self, event: &OrderCreatedEvent) -> Result<Reservation, ConsumeError> {
        match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.apply(event)).await {
                Ok(result) => result,
                Err(_) => Err(ConsumeError::Timeout(limit)),
            },
            None => self.apply(event).await,
        }
    }

    async fn apply(&self, event: &OrderCreatedEvent) -> Result<Reservation, ConsumeError> {
        event.validate()?;

        match self.config.strategy {
            ReservationStrategy::Sequential => self.apply_sequential(event).await,
            ReservationStrategy::Atomic => self.apply_atomic(event).await,
        }
    }

    /// Read, check and overwrite each line in turn.
    ///
    /// A failing line leaves earlier lines decremented. A redelivered event
    /// is applied again. Two workers reading the same stock both write back
    /// their own decrement and one is lost.
    async fn apply_sequential(&self, event: &OrderCreatedEvent) -> Result<Reservation, ConsumeError> {
        for item in &event.items {
            let mut product = self.inventory.get_by_id(item.product_id).await?;

            if product.stock < item.quantity {
                return Err(ConsumeError::InsufficientStock {
                    product_id: item.product_id,
                    requested: item.quantity,
                    available: product.stock,
                });
            }

            product.stock -= item.quantity;
            self.inventory.update(&product).await?;
            self.metrics.record_stock_decrement(item.product_id, item.quantity);

            tracing::debug!(
                order_id = event.order_id,
                product_id = item.product_id,
                quantity = item.quantity,
                remaining = product.stock,
                "Decremented stock"
            );
        }

        Ok(Reservation::Applied)
    }

    async fn apply_atomic(&self, event: &OrderCreatedEvent) -> Result<Reservation, ConsumeError> {
        let retry = RetryConfig::stock_reservation();
        let operation = retry.operation;

        let result = retry_on_transient(retry, |attempt| {
            if attempt > 1 {
                self.metrics.record_retry_attempt(operation);
            }
            self.inventory.reserve(event.order_id, &event.items)
        })
        .await;

        let reservation = result.into_result()?;

        match reservation {
            Reservation::Applied => {
                for (product_id, quantity) in event.merged_lines()? {
                    self.metrics.record_stock_decrement(product_id, quantity);
                }
            }
            Reservation::AlreadyApplied => {
                tracing::info!(order_id = event.order_id, "Duplicate order event, stock already reserved");
            }
        }

        Ok(reservation)
    }

    async fn settle_failure(
        &self,
        delivery: &Delivery,
        order_id: Option<i64>,
        err: ConsumeError,
    ) -> Result<Disposition, BrokerError> {
        let exhausted = match self.config.redelivery.max_deliveries {
            None => false,
            Some(max) => !err.is_transient() || delivery.delivery_count() >= max,
        };

        if !exhausted {
            tracing::warn!(
                order_id = ?order_id,
                delivery_count = delivery.delivery_count(),
                error = %err,
                "Failed to reserve stock, requeueing event"
            );
            self.broker.reject(delivery, true).await?;
            return Ok(Disposition::Requeued);
        }

        tracing::error!(
            order_id = ?order_id,
            delivery_count = delivery.delivery_count(),
            error = %err,
            "Dead-lettering order event"
        );
        self.broker.dead_letter(delivery, &err.to_string()).await?;

        if let Some(order_id) = order_id {
            self.compensate(order_id).await;
        }
        Ok(Disposition::DeadLettered)
    }

    async fn compensate(&self, order_id: i64) {
        let Some(orders) = &self.orders else {
            if self.config.failure_policy != ReservationFailurePolicy::None {
                tracing::warn!(order_id = order_id, "No order store configured, order left unchanged");
            }
            return;
        };
        compensate_order(orders.as_ref(), self.config.failure_policy, order_id, &self.metrics).await;
    }

    /// Pulls and handles deliveries one at a time until `shutdown` flips to
    /// true or the broker closes. A delivery in progress is always finished.
    pub async fn run(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = worker_id,
            strategy = self.strategy_label(),
            max_deliveries = ?self.config.redelivery.max_deliveries,
            "Stock consumer started"
        );
        self.report(HealthStatus::Healthy).await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.broker.receive() => match received {
                    Ok(delivery) => {
                        if let Err(e) = self.handle_delivery(&delivery).await {
                            tracing::error!(
                                worker_id = worker_id,
                                error = %e,
                                "Failed to settle delivery"
                            );
                            self.report(HealthStatus::Degraded(e.to_string())).await;
                        }
                    }
                    Err(BrokerError::Closed) => break,
                    Err(e) => {
                        tracing::error!(worker_id = worker_id, error = %e, "Failed to receive delivery");
                        self.report(HealthStatus::Degraded(e.to_string())).await;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        tracing::info!(worker_id = worker_id, "Stock consumer stopped");
    }

    /// Records that worker `worker_id` died mid-delivery and is being
    /// replaced. The delivery it held stays unsettled until the broker
    /// redelivers it.
    pub(crate) async fn worker_restarted(&self, worker_id: usize, error: &str) {
        self.metrics.worker_restarts.inc();
        if let Some(health) = &self.health {
            let update = UpdateHealth::new(
                "stock_consumer",
                HealthStatus::Degraded(format!("worker {} restarted after a panic", worker_id)),
            )
            .with_details(error);
            let _ = health.tell(update).send().await;
        }
    }

    async fn report(&self, status: HealthStatus) {
        if let Some(health) = &self.health {
            let _ = health.tell(UpdateHealth::new("stock_consumer", status)).send().await;
        }
    }
}
