//! Shared fixtures: in-memory stores, broker and a consumer wired together.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Barrier;

use stock_reservation::config::ConsumerConfig;
use stock_reservation::domain::{EventItem, NewProduct, OrderCreatedEvent, OrderStatus, Product};
use stock_reservation::messaging::{Broker, InMemoryBroker, Message, ORDER_CREATED_ROUTING_KEY};
use stock_reservation::metrics::Metrics;
use stock_reservation::pipeline::{Disposition, StockConsumer};
use stock_reservation::store::{InMemoryInventoryStore, InMemoryOrderStore, InventoryError, InventoryStore, Reservation};

pub struct Harness {
    pub broker: InMemoryBroker,
    pub inventory: InMemoryInventoryStore,
    pub orders: InMemoryOrderStore,
    pub metrics: Arc<Metrics>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: InMemoryBroker::default(),
            inventory: InMemoryInventoryStore::new(),
            orders: InMemoryOrderStore::new(),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    pub async fn with_stock(self, product_id: i64, stock: i32) -> Self {
        self.inventory.put(product(product_id, stock)).await;
        self
    }

    pub fn consumer(&self, config: ConsumerConfig) -> StockConsumer {
        StockConsumer::new(
            Arc::new(self.broker.clone()),
            Arc::new(self.inventory.clone()),
            config,
            self.metrics.clone(),
        )
        .with_order_store(Arc::new(self.orders.clone()))
    }

    pub async fn publish(&self, event: &OrderCreatedEvent) {
        self.broker
            .publish(Message::persistent(
                ORDER_CREATED_ROUTING_KEY,
                event.order_id.to_string(),
                event.to_payload().unwrap(),
            ))
            .await
            .unwrap();
    }

    pub async fn handle_next(&self, consumer: &StockConsumer) -> Disposition {
        let delivery = self.broker.try_receive().await.expect("a queued delivery");
        consumer.handle_delivery(&delivery).await.unwrap()
    }

    pub async fn stock(&self, product_id: i64) -> i32 {
        self.inventory.stock_of(product_id).await.unwrap()
    }
}

pub fn product(id: i64, stock: i32) -> Product {
    Product {
        id,
        name: format!("product-{}", id),
        description: String::new(),
        price: 10.0,
        stock,
    }
}

pub fn event(order_id: i64, items: &[(i64, i32)]) -> OrderCreatedEvent {
    OrderCreatedEvent {
        order_id,
        user_id: 1,
        items: items.iter().map(|&(p, q)| EventItem::new(p, q)).collect(),
        status: OrderStatus::Pending,
        timestamp: Utc::now(),
    }
}

/// Inventory whose reads wait at a barrier, forcing two consumers to read the
/// same stock before either writes.
#[derive(Clone)]
pub struct InterleavedReads {
    inner: InMemoryInventoryStore,
    barrier: Arc<Barrier>,
}

impl InterleavedReads {
    pub fn new(inner: InMemoryInventoryStore, readers: usize) -> Self {
        Self {
            inner,
            barrier: Arc::new(Barrier::new(readers)),
        }
    }
}

#[async_trait]
impl InventoryStore for InterleavedReads {
    async fn create(&self, product: NewProduct) -> Result<Product, InventoryError> {
        self.inner.create(product).await
    }

    async fn get_by_id(&self, id: i64) -> Result<Product, InventoryError> {
        let product = self.inner.get_by_id(id).await;
        self.barrier.wait().await;
        product
    }

    async fn list(&self) -> Result<Vec<Product>, InventoryError> {
        self.inner.list().await
    }

    async fn update(&self, product: &Product) -> Result<(), InventoryError> {
        self.inner.update(product).await
    }

    async fn reserve(&self, order_id: i64, items: &[EventItem]) -> Result<Reservation, InventoryError> {
        self.inner.reserve(order_id, items).await
    }
}
