use kameo::prelude::*;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stock_reservation::config::{Config, PublishMode};
use stock_reservation::health::HealthMonitorActor;
use stock_reservation::messaging::{Broker, EventPublisher, RedpandaBroker};
use stock_reservation::metrics::{self, Metrics, MetricsServerState};
use stock_reservation::pipeline::{ConsumerPool, OutboxRelay, StockConsumer};
use stock_reservation::store::postgres::{self, PostgresInventoryStore, PostgresOrderStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter, e.g. RUST_LOG=debug
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,stock_reservation=debug")))
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        workers = config.consumer.workers,
        strategy = ?config.consumer.strategy,
        max_deliveries = ?config.consumer.redelivery.max_deliveries,
        failure_policy = ?config.consumer.failure_policy,
        publish_mode = ?config.publish_mode,
        "Starting stock reservation service"
    );

    // === 1. Database ===
    let pool = postgres::connect(&config.database).await?;
    postgres::migrate(&pool).await?;
    let orders = Arc::new(PostgresOrderStore::new(pool.clone()));
    let inventory = Arc::new(PostgresInventoryStore::new(pool.clone()));

    // === 2. Metrics + health ===
    let metrics = Arc::new(Metrics::new()?);
    let topology = config.broker.topology();
    let producer: Arc<dyn Broker> = Arc::new(RedpandaBroker::producer(&config.broker, topology.clone())?);

    let health = HealthMonitorActor::spawn(
        HealthMonitorActor::new()
            .watch_broker("redpanda", producer.clone())
            .with_metrics(metrics.clone()),
    );

    let server_state = MetricsServerState {
        registry: metrics.registry().clone(),
        health: health.clone(),
    };
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build metrics runtime");
                return;
            }
        };
        runtime.block_on(async {
            if let Err(e) = metrics::start_metrics_server(server_state, metrics_port).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    });

    // === 3. Outbox relay ===
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_handle = match config.publish_mode {
        PublishMode::Outbox => {
            let relay = OutboxRelay::new(
                orders.clone(),
                EventPublisher::new(producer.clone()),
                config.outbox.clone(),
                metrics.clone(),
            )
            .with_compensation(orders.clone(), config.consumer.failure_policy)
            .with_health(health.clone());
            Some(tokio::spawn(relay.run(shutdown_rx)))
        }
        PublishMode::Direct => None,
    };

    // === 4. Consumer pool, one group member per worker ===
    let template = StockConsumer::new(
        producer.clone(),
        inventory,
        config.consumer.clone(),
        metrics.clone(),
    )
    .with_order_store(orders)
    .with_health(health.clone());

    let mut consumers = Vec::with_capacity(config.consumer.workers);
    for _ in 0..config.consumer.workers {
        let broker: Arc<dyn Broker> = Arc::new(RedpandaBroker::consumer(&config.broker, topology.clone())?);
        consumers.push(template.with_broker(broker));
    }
    let consumer_pool = ConsumerPool::spawn(consumers);

    // === 5. Run until interrupted ===
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    consumer_pool.shutdown().await;
    if let Some(handle) = relay_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Outbox relay task failed");
        }
    }
    pool.close().await;

    tracing::info!("Stock reservation service stopped");
    Ok(())
}
