use proptest::prelude::*;
use std::time::Duration;

use stock_reservation::config::{ConsumerConfig, RedeliveryPolicy, ReservationFailurePolicy};
use stock_reservation::domain::{EventItem, OrderStatus};
use stock_reservation::pipeline::Disposition;
use stock_reservation::store::{InMemoryInventoryStore, InventoryError, InventoryStore, OrderStore, Reservation};

use crate::support::{event, product, Harness};

fn atomic(max_deliveries: u32) -> ConsumerConfig {
    ConsumerConfig {
        redelivery: RedeliveryPolicy::bounded(max_deliveries),
        handler_timeout: Some(Duration::from_secs(5)),
        ..ConsumerConfig::default()
    }
}

#[tokio::test]
async fn test_failing_line_rolls_back_whole_event() {
    let harness = Harness::new().with_stock(5, 10).await.with_stock(6, 1).await;
    let consumer = harness.consumer(atomic(5));

    harness.publish(&event(1, &[(5, 2), (6, 4)])).await;

    assert_eq!(harness.handle_next(&consumer).await, Disposition::Requeued);
    assert_eq!(harness.stock(5).await, 10);
    assert_eq!(harness.stock(6).await, 1);
}

#[tokio::test]
async fn test_replay_is_acknowledged_without_change() {
    let harness = Harness::new().with_stock(5, 10).await;
    let consumer = harness.consumer(atomic(5));

    let order = event(1, &[(5, 2)]);
    harness.publish(&order).await;
    harness.publish(&order).await;

    assert_eq!(harness.handle_next(&consumer).await, Disposition::Acked);
    assert_eq!(harness.handle_next(&consumer).await, Disposition::Duplicate);
    assert_eq!(harness.stock(5).await, 8);
    assert_eq!(harness.broker.acked().await.len(), 2);
}

#[tokio::test]
async fn test_concurrent_events_never_oversell() {
    let harness = Harness::new().with_stock(5, 5).await;
    let consumer = harness.consumer(atomic(5));

    harness.publish(&event(1, &[(5, 3)])).await;
    harness.publish(&event(2, &[(5, 3)])).await;

    let first = harness.broker.try_receive().await.unwrap();
    let second = harness.broker.try_receive().await.unwrap();
    let (a, b) = tokio::join!(consumer.handle_delivery(&first), consumer.handle_delivery(&second));

    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|d| d.as_str());
    assert_eq!(outcomes, vec![Disposition::Acked, Disposition::Requeued]);
    assert_eq!(harness.stock(5).await, 2);
}

#[tokio::test]
async fn test_poison_message_dead_letters_after_threshold() {
    let harness = Harness::new();
    let order = harness
        .orders
        .create(
            stock_reservation::domain::NewOrder::new(
                1,
                vec![stock_reservation::domain::NewOrderItem::new(999, 1)],
            ),
            false,
        )
        .await
        .unwrap();
    let consumer = harness.consumer(atomic(3));

    harness.publish(&event(order.id, &[(999, 1)])).await;

    assert_eq!(harness.handle_next(&consumer).await, Disposition::Requeued);
    assert_eq!(harness.handle_next(&consumer).await, Disposition::Requeued);
    assert_eq!(harness.handle_next(&consumer).await, Disposition::DeadLettered);

    assert_eq!(harness.broker.ready_count().await, 0);
    let dead = harness.broker.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("999"));
    assert_eq!(harness.orders.get_by_id(order.id).await.unwrap().status, OrderStatus::OnHold);
}

#[tokio::test]
async fn test_malformed_event_dead_letters_immediately_and_leaves_order() {
    let harness = Harness::new().with_stock(5, 10).await;
    let order = harness
        .orders
        .create(
            stock_reservation::domain::NewOrder::new(
                1,
                vec![stock_reservation::domain::NewOrderItem::new(5, 1)],
            ),
            false,
        )
        .await
        .unwrap();
    let config = ConsumerConfig {
        failure_policy: ReservationFailurePolicy::None,
        ..atomic(5)
    };
    let consumer = harness.consumer(config);

    harness.publish(&event(order.id, &[(5, -1)])).await;

    assert_eq!(harness.handle_next(&consumer).await, Disposition::DeadLettered);
    assert_eq!(harness.stock(5).await, 10);
    assert_eq!(harness.orders.get_by_id(order.id).await.unwrap().status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_overflowing_line_total_dead_letters_without_touching_stock() {
    let harness = Harness::new().with_stock(5, 10).await;
    let consumer = harness.consumer(atomic(5));

    harness.publish(&event(1, &[(5, i32::MAX), (5, 2)])).await;

    assert_eq!(harness.handle_next(&consumer).await, Disposition::DeadLettered);
    assert_eq!(harness.stock(5).await, 10);
    assert!(harness.broker.dead_letters().await[0].reason.contains("product 5"));

    let direct = harness
        .inventory
        .reserve(2, &[EventItem::new(5, i32::MAX), EventItem::new(5, 2)])
        .await;
    assert!(matches!(direct, Err(InventoryError::Invalid(_))));
    assert_eq!(harness.stock(5).await, 10);
}

#[tokio::test]
async fn test_duplicate_lines_are_summed() {
    let inventory = InMemoryInventoryStore::new();
    inventory.put(product(5, 4)).await;

    let result = inventory
        .reserve(1, &[EventItem::new(5, 3), EventItem::new(5, 2)])
        .await;

    assert!(matches!(
        result,
        Err(InventoryError::InsufficientStock { requested: 5, available: 4, .. })
    ));
    assert_eq!(inventory.stock_of(5).await, Some(4));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Any sequence of reservations, replays included, keeps every stock
    /// level non-negative and accounts for every applied unit.
    #[test]
    fn stock_never_negative(
        initial in prop::collection::vec(0i32..20, 3),
        orders in prop::collection::vec(
            (1i64..8, prop::collection::vec((1i64..4, 1i32..6), 1..4)),
            1..30,
        ),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let inventory = InMemoryInventoryStore::new();
            for (index, stock) in initial.iter().enumerate() {
                inventory.put(product(index as i64 + 1, *stock)).await;
            }

            let mut applied = [0i32; 3];
            for (order_id, lines) in &orders {
                let items: Vec<EventItem> = lines.iter().map(|&(p, q)| EventItem::new(p, q)).collect();
                if let Ok(Reservation::Applied) = inventory.reserve(*order_id, &items).await {
                    for item in &items {
                        applied[(item.product_id - 1) as usize] += item.quantity;
                    }
                }
            }

            for (index, stock) in initial.iter().enumerate() {
                let now = inventory.stock_of(index as i64 + 1).await.unwrap();
                assert!(now >= 0);
                assert_eq!(now, stock - applied[index]);
            }
        });
    }
}
