use kameo::actor::ActorRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{OutboxConfig, ReservationFailurePolicy};
use crate::health::{HealthMonitorActor, HealthStatus, UpdateHealth};
use crate::messaging::EventPublisher;
use crate::metrics::Metrics;
use crate::store::{OrderStore, OrderStoreError, OutboxRecord, OutboxStore};
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

use super::compensation::compensate_order;

// ============================================================================
// Outbox Relay - polls committed outbox rows and publishes them
// ============================================================================
//
// 1. Fetch up to `batch_size` unpublished rows, oldest first
// 2. Publish each with a short in-process retry
// 3. Mark published on success
// 4. Transient failure: bump the attempt counter, stop the pass and back off
//    before the next poll. The row stays pending however long the outage.
// 5. Permanent failure (broker refuses the message): park the row and apply
//    the failure policy to its order
//
// A crash between publish and mark publishes the row again on restart.
// Consumers running the atomic strategy skip the duplicate by order id.
//
// ============================================================================

const COMPONENT: &str = "outbox_relay";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub published: usize,
    /// Rows left pending after a transient failure.
    pub failed: usize,
    pub parked: usize,
}

pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    publisher: EventPublisher,
    config: OutboxConfig,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
    health: Option<ActorRef<HealthMonitorActor>>,
    orders: Option<Arc<dyn OrderStore>>,
    failure_policy: ReservationFailurePolicy,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        publisher: EventPublisher,
        config: OutboxConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            outbox,
            publisher,
            config,
            retry: RetryConfig::outbox_publish(),
            metrics,
            health: None,
            orders: None,
            failure_policy: ReservationFailurePolicy::None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_health(mut self, health: ActorRef<HealthMonitorActor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Order store and policy applied to orders whose event is parked.
    pub fn with_compensation(mut self, orders: Arc<dyn OrderStore>, policy: ReservationFailurePolicy) -> Self {
        self.orders = Some(orders);
        self.failure_policy = policy;
        self
    }

    /// Relays one batch. Stops at the first transient failure so that a
    /// broker outage does not burn attempts on the whole backlog.
    pub async fn relay_once(&self) -> Result<RelayStats, OrderStoreError> {
        let records = self.outbox.pending(self.config.batch_size).await?;
        let mut stats = RelayStats::default();

        if !records.is_empty() {
            tracing::debug!(count = records.len(), "Fetched pending outbox records");
        }

        for record in records {
            let key = record.order_id.to_string();
            let result = retry_on_transient(self.retry.clone(), |attempt| {
                if attempt > 1 {
                    self.metrics.record_retry_attempt(self.retry.operation);
                }
                self.publisher
                    .publish_raw(&record.routing_key, &key, record.payload.clone())
            })
            .await;

            match result {
                RetryResult::Success(()) => {
                    self.outbox.mark_published(record.id).await?;
                    self.metrics.outbox_relayed.inc();
                    stats.published += 1;

                    tracing::info!(
                        outbox_id = record.id,
                        order_id = record.order_id,
                        "Relayed order event"
                    );
                }
                RetryResult::PermanentFailure(e) => {
                    self.park(&record, &e.to_string()).await?;
                    stats.parked += 1;
                }
                RetryResult::Failed(e) => {
                    let error = e.to_string();
                    let attempts = self.outbox.record_failure(record.id, &error).await?;
                    self.metrics.record_publish_failure("outbox");
                    stats.failed += 1;

                    tracing::warn!(
                        outbox_id = record.id,
                        order_id = record.order_id,
                        attempts = attempts,
                        error = %error,
                        "Outbox publish failed, will retry on next poll"
                    );
                    break;
                }
            }
        }

        Ok(stats)
    }

    async fn park(&self, record: &OutboxRecord, error: &str) -> Result<(), OrderStoreError> {
        let attempts = self.outbox.record_failure(record.id, error).await?;
        self.outbox.mark_failed(record.id, error).await?;
        self.metrics.record_publish_failure("outbox");
        self.metrics.outbox_parked.inc();

        tracing::error!(
            outbox_id = record.id,
            order_id = record.order_id,
            attempts = attempts,
            error = %error,
            "Broker refused order event, parking outbox record"
        );

        if let Some(orders) = &self.orders {
            compensate_order(orders.as_ref(), self.failure_policy, record.order_id, &self.metrics).await;
        }
        Ok(())
    }

    /// Wait before the next poll: the poll interval, doubled for every
    /// consecutive pass that ended on a transient failure, capped at
    /// `max_backoff`.
    fn next_poll_delay(&self, consecutive_failures: u32) -> Duration {
        let factor = 1u32 << consecutive_failures.min(16);
        self.config
            .poll_interval
            .saturating_mul(factor)
            .min(self.config.max_backoff.max(self.config.poll_interval))
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_backoff_ms = self.config.max_backoff.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox relay"
        );

        let mut consecutive_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let status = match self.relay_once().await {
                Ok(stats) if stats.failed == 0 => {
                    consecutive_failures = 0;
                    if stats.parked == 0 {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Degraded(format!("{} outbox records parked", stats.parked))
                    }
                }
                Ok(_) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    HealthStatus::Degraded(format!(
                        "broker publish failing for {} consecutive polls",
                        consecutive_failures
                    ))
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::error!(error = %e, "Failed to read outbox");
                    HealthStatus::Unhealthy(e.to_string())
                }
            };
            self.report(status).await;

            let delay = self.next_poll_delay(consecutive_failures);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    async fn report(&self, status: HealthStatus) {
        if let Some(health) = &self.health {
            let _ = health.tell(UpdateHealth::new(COMPONENT, status)).send().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewOrder, NewOrderItem, OrderCreatedEvent, OrderStatus};
    use crate::messaging::{Broker, InMemoryBroker};
    use crate::store::InMemoryOrderStore;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            operation: "outbox_publish",
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
        }
    }

    fn outbox_config() -> OutboxConfig {
        OutboxConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 10,
            max_backoff: Duration::from_millis(80),
        }
    }

    fn relay(store: &InMemoryOrderStore, broker: &InMemoryBroker) -> OutboxRelay {
        OutboxRelay::new(
            Arc::new(store.clone()),
            EventPublisher::new(Arc::new(broker.clone())),
            outbox_config(),
            Arc::new(Metrics::new().unwrap()),
        )
        .with_retry(fast_retry())
    }

    async fn committed_order(store: &InMemoryOrderStore) -> i64 {
        store
            .create(NewOrder::new(1, vec![NewOrderItem::new(5, 2)]), true)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_relays_committed_rows_once() {
        let store = InMemoryOrderStore::new();
        let broker = InMemoryBroker::default();
        let order_id = committed_order(&store).await;

        let relay = relay(&store, &broker);
        let stats = relay.relay_once().await.unwrap();
        assert_eq!(stats.published, 1);

        let again = relay.relay_once().await.unwrap();
        assert_eq!(again, RelayStats::default());

        let delivery = broker.receive().await.unwrap();
        assert_eq!(delivery.message.key, order_id.to_string());
        let event = OrderCreatedEvent::from_payload(delivery.payload()).unwrap();
        assert_eq!(event.order_id, order_id);
    }

    #[tokio::test]
    async fn test_outage_never_parks_rows() {
        let store = InMemoryOrderStore::new();
        let broker = InMemoryBroker::default();
        committed_order(&store).await;
        broker.close().await;

        let relay = relay(&store, &broker);
        for _ in 0..25 {
            let stats = relay.relay_once().await.unwrap();
            assert_eq!(stats.failed, 1);
            assert_eq!(stats.parked, 0);
        }
        assert_eq!(store.outbox_records().await[0].attempts, 25);
        assert!(store.failed_outbox_ids().await.is_empty());

        broker.reopen().await;
        assert_eq!(relay.relay_once().await.unwrap().published, 1);
        assert_eq!(broker.ready_count().await, 1);
    }

    #[tokio::test]
    async fn test_refused_row_is_parked_and_order_compensated() {
        let store = InMemoryOrderStore::new();
        let broker = InMemoryBroker::default().with_max_message_bytes(16);
        let order_id = committed_order(&store).await;

        let relay = relay(&store, &broker)
            .with_compensation(Arc::new(store.clone()), ReservationFailurePolicy::Hold);

        let stats = relay.relay_once().await.unwrap();
        assert_eq!(stats.parked, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(store.failed_outbox_ids().await.len(), 1);
        assert_eq!(store.get_by_id(order_id).await.unwrap().status, OrderStatus::OnHold);

        assert_eq!(relay.relay_once().await.unwrap(), RelayStats::default());
    }

    #[tokio::test]
    async fn test_refused_row_does_not_block_later_rows() {
        let store = InMemoryOrderStore::new();
        let broker = InMemoryBroker::default().with_max_message_bytes(200);
        let large = store
            .create(
                NewOrder::new(1, (1..=6).map(|p| NewOrderItem::new(p, 1)).collect()),
                true,
            )
            .await
            .unwrap()
            .id;
        let small = committed_order(&store).await;

        let stats = relay(&store, &broker).relay_once().await.unwrap();
        assert_eq!(stats.parked, 1);
        assert_eq!(stats.published, 1);

        let delivered = broker.receive().await.unwrap();
        assert_eq!(delivered.message.key, small.to_string());
        assert_ne!(delivered.message.key, large.to_string());
    }

    #[test]
    fn test_poll_delay_doubles_up_to_cap() {
        let relay = relay(&InMemoryOrderStore::new(), &InMemoryBroker::default());

        assert_eq!(relay.next_poll_delay(0), Duration::from_millis(10));
        assert_eq!(relay.next_poll_delay(1), Duration::from_millis(20));
        assert_eq!(relay.next_poll_delay(3), Duration::from_millis(80));
        assert_eq!(relay.next_poll_delay(30), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = InMemoryOrderStore::new();
        let broker = InMemoryBroker::default();
        committed_order(&store).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay(&store, &broker).run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.published_outbox_ids().await.len(), 1);
        assert_eq!(broker.ready_count().await, 1);
    }
}
