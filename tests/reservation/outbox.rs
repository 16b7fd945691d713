use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use stock_reservation::config::{ConsumerConfig, OutboxConfig, PublishMode};
use stock_reservation::domain::{NewOrder, NewOrderItem, OrderCreatedEvent};
use stock_reservation::messaging::EventPublisher;
use stock_reservation::pipeline::{Disposition, OrderService, OutboxRelay};

use crate::support::Harness;

fn relay(harness: &Harness) -> OutboxRelay {
    OutboxRelay::new(
        Arc::new(harness.orders.clone()),
        EventPublisher::new(Arc::new(harness.broker.clone())),
        OutboxConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 2,
            max_backoff: Duration::from_millis(40),
        },
        harness.metrics.clone(),
    )
}

#[tokio::test]
async fn test_relay_publishes_exactly_committed_orders() {
    let harness = Harness::new().with_stock(5, 10).await;
    let service = OrderService::new(
        Arc::new(harness.orders.clone()),
        EventPublisher::new(Arc::new(harness.broker.clone())),
        PublishMode::Outbox,
        harness.metrics.clone(),
    );

    let mut committed = BTreeSet::new();
    for _ in 0..3 {
        let order = service
            .place_order(NewOrder::new(1, vec![NewOrderItem::new(5, 1)]))
            .await
            .unwrap();
        committed.insert(order.id);
    }
    assert!(service.place_order(NewOrder::new(1, vec![])).await.is_err());
    assert_eq!(harness.broker.ready_count().await, 0);

    let relay = relay(&harness);
    while relay.relay_once().await.unwrap().published > 0 {}

    let published: BTreeSet<i64> = harness
        .broker
        .ready_messages()
        .await
        .iter()
        .map(|m| OrderCreatedEvent::from_payload(&m.payload).unwrap().order_id)
        .collect();
    assert_eq!(published, committed);

    let consumer = harness.consumer(ConsumerConfig::default());
    for _ in 0..3 {
        assert_eq!(harness.handle_next(&consumer).await, Disposition::Acked);
    }
    assert_eq!(harness.stock(5).await, 7);
}

#[tokio::test]
async fn test_relay_after_broker_outage_delivers_backlog() {
    let harness = Harness::new();
    let service = OrderService::new(
        Arc::new(harness.orders.clone()),
        EventPublisher::new(Arc::new(harness.broker.clone())),
        PublishMode::Outbox,
        harness.metrics.clone(),
    );
    let order = service
        .place_order(NewOrder::new(1, vec![NewOrderItem::new(5, 1)]))
        .await
        .unwrap();

    let outage = stock_reservation::messaging::InMemoryBroker::default();
    outage.close().await;
    let failing = OutboxRelay::new(
        Arc::new(harness.orders.clone()),
        EventPublisher::new(Arc::new(outage)),
        OutboxConfig::default(),
        harness.metrics.clone(),
    )
    .with_retry(stock_reservation::utils::RetryConfig {
        operation: "outbox_publish",
        max_attempts: 1,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        multiplier: 1.0,
    });
    assert_eq!(failing.relay_once().await.unwrap().failed, 1);

    let stats = relay(&harness).relay_once().await.unwrap();
    assert_eq!(stats.published, 1);
    assert_eq!(harness.orders.published_outbox_ids().await.len(), 1);

    let message = &harness.broker.ready_messages().await[0];
    assert_eq!(message.key, order.id.to_string());
}

#[tokio::test]
async fn test_sustained_outage_then_recovery_delivers_every_committed_order() {
    let harness = Harness::new().with_stock(5, 10).await;
    let service = OrderService::new(
        Arc::new(harness.orders.clone()),
        EventPublisher::new(Arc::new(harness.broker.clone())),
        PublishMode::Outbox,
        harness.metrics.clone(),
    );

    let mut committed = BTreeSet::new();
    for _ in 0..3 {
        let order = service
            .place_order(NewOrder::new(1, vec![NewOrderItem::new(5, 1)]))
            .await
            .unwrap();
        committed.insert(order.id);
    }

    harness.broker.close().await;
    let relay = relay(&harness).with_retry(stock_reservation::utils::RetryConfig {
        operation: "outbox_publish",
        max_attempts: 1,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        multiplier: 1.0,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(relay.run(shutdown_rx));

    // Far longer than any attempt budget would allow.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(harness.orders.failed_outbox_ids().await.is_empty());
    assert!(harness.orders.published_outbox_ids().await.is_empty());

    harness.broker.reopen().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let published: BTreeSet<i64> = harness
        .broker
        .ready_messages()
        .await
        .iter()
        .map(|m| OrderCreatedEvent::from_payload(&m.payload).unwrap().order_id)
        .collect();
    assert_eq!(published, committed);
    assert!(harness.orders.failed_outbox_ids().await.is_empty());
}
