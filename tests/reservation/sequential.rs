//! Per-line read/check/write reservation. These tests pin down its known
//! failure modes.

use std::sync::Arc;

use stock_reservation::config::ConsumerConfig;
use stock_reservation::pipeline::{Disposition, StockConsumer};

use crate::support::{event, Harness, InterleavedReads};

#[tokio::test]
async fn test_failure_mid_event_keeps_earlier_lines_decremented() {
    let harness = Harness::new().with_stock(5, 10).await;
    let consumer = harness.consumer(ConsumerConfig::legacy());

    harness.publish(&event(1, &[(5, 2), (999, 1)])).await;

    assert_eq!(harness.handle_next(&consumer).await, Disposition::Requeued);
    assert_eq!(harness.stock(5).await, 8);

    // Each redelivery takes another two units before failing again.
    assert_eq!(harness.handle_next(&consumer).await, Disposition::Requeued);
    assert_eq!(harness.stock(5).await, 6);
}

#[tokio::test]
async fn test_redelivered_event_decrements_twice() {
    let harness = Harness::new().with_stock(5, 10).await;
    let consumer = harness.consumer(ConsumerConfig::legacy());

    let order = event(1, &[(5, 2)]);
    harness.publish(&order).await;
    harness.publish(&order).await;

    assert_eq!(harness.handle_next(&consumer).await, Disposition::Acked);
    assert_eq!(harness.handle_next(&consumer).await, Disposition::Acked);
    assert_eq!(harness.stock(5).await, 6);
}

#[tokio::test]
async fn test_concurrent_events_oversell() {
    let harness = Harness::new().with_stock(5, 5).await;
    let gated = InterleavedReads::new(harness.inventory.clone(), 2);
    let consumer = StockConsumer::new(
        Arc::new(harness.broker.clone()),
        Arc::new(gated),
        ConsumerConfig::legacy(),
        harness.metrics.clone(),
    );

    harness.publish(&event(1, &[(5, 3)])).await;
    harness.publish(&event(2, &[(5, 3)])).await;

    let first = harness.broker.try_receive().await.unwrap();
    let second = harness.broker.try_receive().await.unwrap();

    let (a, b) = tokio::join!(consumer.handle_delivery(&first), consumer.handle_delivery(&second));

    // Both passed the stock check against the same read of 5 units, so six
    // units were promised while the stored stock only dropped by three.
    assert_eq!(a.unwrap(), Disposition::Acked);
    assert_eq!(b.unwrap(), Disposition::Acked);
    assert_eq!(harness.stock(5).await, 2);
    assert_eq!(harness.broker.acked().await.len(), 2);
}
