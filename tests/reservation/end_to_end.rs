use std::sync::Arc;

use stock_reservation::config::{ConsumerConfig, PublishMode};
use stock_reservation::domain::{NewOrder, NewOrderItem, OrderStatus, ValidationError};
use stock_reservation::messaging::EventPublisher;
use stock_reservation::pipeline::{Disposition, OrderService, OrderServiceError};
use stock_reservation::store::OrderStore;

use crate::support::Harness;

fn order_service(harness: &Harness, mode: PublishMode) -> OrderService {
    OrderService::new(
        Arc::new(harness.orders.clone()),
        EventPublisher::new(Arc::new(harness.broker.clone())),
        mode,
        harness.metrics.clone(),
    )
}

#[tokio::test]
async fn test_order_reserves_stock_end_to_end() {
    let harness = Harness::new().with_stock(5, 10).await;
    let service = order_service(&harness, PublishMode::Direct);
    let consumer = harness.consumer(ConsumerConfig::legacy());

    let order = service
        .place_order(NewOrder::new(1, vec![NewOrderItem::new(5, 2)]))
        .await
        .unwrap();

    assert_eq!(harness.handle_next(&consumer).await, Disposition::Acked);

    assert_eq!(harness.stock(5).await, 8);
    assert_eq!(harness.broker.acked().await.len(), 1);
    let stored = harness.orders.get_by_id(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.items.len(), 1);
}

#[tokio::test]
async fn test_unknown_product_is_requeued_forever_under_legacy_policy() {
    let harness = Harness::new().with_stock(5, 10).await;
    let service = order_service(&harness, PublishMode::Direct);
    let consumer = harness.consumer(ConsumerConfig::legacy());

    service
        .place_order(NewOrder::new(1, vec![NewOrderItem::new(999, 1)]))
        .await
        .unwrap();

    for attempt in 1..=10u32 {
        assert_eq!(harness.handle_next(&consumer).await, Disposition::Requeued);
        let ready = harness.broker.ready_messages().await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].delivery_count, attempt);
    }

    assert_eq!(harness.stock(5).await, 10);
    assert!(harness.broker.dead_letters().await.is_empty());
    assert!(harness.broker.acked().await.is_empty());
}

#[tokio::test]
async fn test_invalid_order_is_never_persisted_or_published() {
    let harness = Harness::new();
    let service = order_service(&harness, PublishMode::Direct);

    let empty = service.place_order(NewOrder::new(1, vec![])).await;
    assert!(matches!(
        empty,
        Err(OrderServiceError::Validation(ValidationError::EmptyItems))
    ));

    let bad_quantity = service
        .place_order(NewOrder::new(1, vec![NewOrderItem::new(5, 0)]))
        .await;
    assert!(matches!(bad_quantity, Err(OrderServiceError::Validation(_))));

    assert_eq!(harness.orders.order_count().await, 0);
    assert_eq!(harness.broker.ready_count().await, 0);
}

#[tokio::test]
async fn test_direct_publish_failure_leaves_order_without_event() {
    let harness = Harness::new().with_stock(5, 10).await;
    let service = order_service(&harness, PublishMode::Direct);
    harness.broker.close().await;

    let order = service
        .place_order(NewOrder::new(1, vec![NewOrderItem::new(5, 2)]))
        .await
        .unwrap();

    assert_eq!(harness.orders.get_by_id(order.id).await.unwrap().status, OrderStatus::Pending);
    assert_eq!(harness.broker.ready_count().await, 0);
    assert_eq!(harness.stock(5).await, 10);
}
