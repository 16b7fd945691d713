mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub use server::{start_metrics_server, MetricsServerState};

use crate::utils::CircuitState;

// ============================================================================
// Metrics - Prometheus instruments for the reservation pipeline
// ============================================================================
//
// - Order placement and event publication
// - Outbox relay throughput and parked rows
// - Consumer outcomes (acked, duplicate, requeued, dead-lettered)
// - Consumer worker restarts
// - Stock decrements per product
// - In-process retries
// - Broker circuit breaker state
//
// Scraped via /metrics on the metrics server.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Order placement
    pub orders_placed: IntCounter,
    pub publish_failures: IntCounterVec,

    // Outbox relay
    pub outbox_relayed: IntCounter,
    pub outbox_parked: IntCounter,

    // Consumer
    pub events_received: IntCounter,
    pub events_outcome: IntCounterVec,
    pub events_failed: IntCounterVec,
    pub stock_decremented: IntCounterVec,
    pub handling_duration: HistogramVec,
    pub compensations: IntCounterVec,
    pub worker_restarts: IntCounter,

    // Retries
    pub retry_attempts: IntCounterVec,

    // Broker
    pub circuit_breaker_state: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let orders_placed = IntCounter::new("orders_placed_total", "Orders committed by order placement")?;
        registry.register(Box::new(orders_placed.clone()))?;

        let publish_failures = IntCounterVec::new(
            Opts::new("order_event_publish_failures_total", "Order events the broker did not accept"),
            &["path"],
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        let outbox_relayed = IntCounter::new("outbox_relayed_total", "Outbox rows published to the broker")?;
        registry.register(Box::new(outbox_relayed.clone()))?;

        let outbox_parked = IntCounter::new(
            "outbox_parked_total",
            "Outbox rows the broker refused and the relay gave up on",
        )?;
        registry.register(Box::new(outbox_parked.clone()))?;

        let events_received = IntCounter::new("order_events_received_total", "Order events delivered to consumers")?;
        registry.register(Box::new(events_received.clone()))?;

        let events_outcome = IntCounterVec::new(
            Opts::new("order_events_settled_total", "Order events by final disposition"),
            &["outcome"],
        )?;
        registry.register(Box::new(events_outcome.clone()))?;

        let events_failed = IntCounterVec::new(
            Opts::new("order_events_failed_total", "Order event handling failures by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(events_failed.clone()))?;

        let stock_decremented = IntCounterVec::new(
            Opts::new("stock_decremented_units_total", "Units of stock reserved per product"),
            &["product_id"],
        )?;
        registry.register(Box::new(stock_decremented.clone()))?;

        let handling_duration = HistogramVec::new(
            HistogramOpts::new("order_event_handling_seconds", "Time from receive to settle")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["strategy"],
        )?;
        registry.register(Box::new(handling_duration.clone()))?;

        let compensations = IntCounterVec::new(
            Opts::new("order_compensations_total", "Order status changes after a dead-lettered event"),
            &["status"],
        )?;
        registry.register(Box::new(compensations.clone()))?;

        let worker_restarts = IntCounter::new(
            "consumer_worker_restarts_total",
            "Consumer workers restarted after a panic",
        )?;
        registry.register(Box::new(worker_restarts.clone()))?;

        let retry_attempts = IntCounterVec::new(
            Opts::new("retry_attempts_total", "In-process retry attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_attempts.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Broker circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            orders_placed,
            publish_failures,
            outbox_relayed,
            outbox_parked,
            events_received,
            events_outcome,
            events_failed,
            stock_decremented,
            handling_duration,
            compensations,
            worker_restarts,
            retry_attempts,
            circuit_breaker_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_publish_failure(&self, path: &str) {
        self.publish_failures.with_label_values(&[path]).inc();
    }

    pub fn record_outcome(&self, outcome: &str, strategy: &str, duration_secs: f64) {
        self.events_outcome.with_label_values(&[outcome]).inc();
        self.handling_duration.with_label_values(&[strategy]).observe(duration_secs);
    }

    pub fn record_failure(&self, reason: &str) {
        self.events_failed.with_label_values(&[reason]).inc();
    }

    pub fn record_stock_decrement(&self, product_id: i64, quantity: i32) {
        if quantity > 0 {
            self.stock_decremented
                .with_label_values(&[&product_id.to_string()])
                .inc_by(quantity as u64);
        }
    }

    pub fn record_compensation(&self, status: &str) {
        self.compensations.with_label_values(&[status]).inc();
    }

    pub fn record_retry_attempt(&self, operation: &str) {
        self.retry_attempts.with_label_values(&[operation]).inc();
    }

    pub fn update_circuit_breaker_state(&self, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.circuit_breaker_state.set(value);
    }
}
