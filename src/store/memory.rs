use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    merge_lines, InventoryError, InventoryStore, OrderStore, OrderStoreError, OutboxRecord,
    OutboxStore, Reservation,
};
use crate::domain::{
    EventItem, NewOrder, NewProduct, Order, OrderCreatedEvent, OrderItem, OrderStatus, Product,
};
use crate::messaging::ORDER_CREATED_ROUTING_KEY;

// ============================================================================
// In-Memory Order Store
// ============================================================================
//
// Single-process stand-in for the Postgres store. One mutex guards orders
// and outbox together, so `create` is atomic with respect to every reader.
//
// ============================================================================

#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<Mutex<OrderState>>,
}

#[derive(Default)]
struct OrderState {
    orders: BTreeMap<i64, Order>,
    outbox: BTreeMap<i64, OutboxEntry>,
    next_order_id: i64,
    next_item_id: i64,
    next_outbox_id: i64,
}

struct OutboxEntry {
    record: OutboxRecord,
    published: bool,
    failed: bool,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outbox record ever written, published or not.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        let state = self.state.lock().await;
        state.outbox.values().map(|e| e.record.clone()).collect()
    }

    pub async fn published_outbox_ids(&self) -> Vec<i64> {
        let state = self.state.lock().await;
        state
            .outbox
            .values()
            .filter(|e| e.published)
            .map(|e| e.record.id)
            .collect()
    }

    pub async fn failed_outbox_ids(&self) -> Vec<i64> {
        let state = self.state.lock().await;
        state
            .outbox
            .values()
            .filter(|e| e.failed)
            .map(|e| e.record.id)
            .collect()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: NewOrder, with_outbox: bool) -> Result<Order, OrderStoreError> {
        let mut state = self.state.lock().await;

        let order_id = state.next_order_id + 1;
        let mut next_item_id = state.next_item_id;
        let items = order
            .items
            .iter()
            .map(|item| {
                next_item_id += 1;
                OrderItem {
                    id: next_item_id,
                    order_id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                }
            })
            .collect();

        let created_at = Utc::now();
        let stored = Order {
            id: order_id,
            user_id: order.user_id,
            status: OrderStatus::Pending,
            created_at,
            items,
        };

        // Serialize before mutating so a failure leaves nothing behind.
        let outbox_payload = if with_outbox {
            Some(OrderCreatedEvent::from_order(&stored, created_at).to_payload()?)
        } else {
            None
        };

        state.next_order_id = order_id;
        state.next_item_id = next_item_id;
        state.orders.insert(order_id, stored.clone());

        if let Some(payload) = outbox_payload {
            state.next_outbox_id += 1;
            let id = state.next_outbox_id;
            state.outbox.insert(
                id,
                OutboxEntry {
                    record: OutboxRecord {
                        id,
                        order_id,
                        routing_key: ORDER_CREATED_ROUTING_KEY.to_string(),
                        payload,
                        created_at,
                        attempts: 0,
                        last_error: None,
                    },
                    published: false,
                    failed: false,
                },
            );
        }

        tracing::debug!(
            order_id = order_id,
            item_count = stored.items.len(),
            with_outbox = with_outbox,
            "Stored order in memory"
        );

        Ok(stored)
    }

    async fn get_by_id(&self, id: i64) -> Result<Order, OrderStoreError> {
        let state = self.state.lock().await;
        state.orders.get(&id).cloned().ok_or(OrderStoreError::NotFound(id))
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Order>, OrderStoreError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: i64, status: OrderStatus) -> Result<(), OrderStoreError> {
        let mut state = self.state.lock().await;
        let order = state.orders.get_mut(&id).ok_or(OrderStoreError::NotFound(id))?;
        order.status = status;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOrderStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OrderStoreError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .values()
            .filter(|e| !e.published && !e.failed)
            .take(limit)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn mark_published(&self, id: i64) -> Result<(), OrderStoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .outbox
            .get_mut(&id)
            .ok_or(OrderStoreError::OutboxRecordNotFound(id))?;
        entry.published = true;
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<i32, OrderStoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .outbox
            .get_mut(&id)
            .ok_or(OrderStoreError::OutboxRecordNotFound(id))?;
        entry.record.attempts += 1;
        entry.record.last_error = Some(error.to_string());
        Ok(entry.record.attempts)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), OrderStoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .outbox
            .get_mut(&id)
            .ok_or(OrderStoreError::OutboxRecordNotFound(id))?;
        entry.failed = true;
        entry.record.last_error = Some(error.to_string());
        Ok(())
    }
}

// ============================================================================
// In-Memory Inventory Store
// ============================================================================

#[derive(Clone, Default)]
pub struct InMemoryInventoryStore {
    state: Arc<Mutex<InventoryState>>,
}

#[derive(Default)]
struct InventoryState {
    products: BTreeMap<i64, Product>,
    processed_orders: HashSet<i64>,
    next_id: i64,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a product with a caller-chosen id, replacing any existing row.
    pub async fn put(&self, product: Product) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(product.id);
        state.products.insert(product.id, product);
    }

    /// Current stock of a product, `None` if the product does not exist.
    pub async fn stock_of(&self, id: i64) -> Option<i32> {
        self.state.lock().await.products.get(&id).map(|p| p.stock)
    }

    pub async fn is_processed(&self, order_id: i64) -> bool {
        self.state.lock().await.processed_orders.contains(&order_id)
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn create(&self, product: NewProduct) -> Result<Product, InventoryError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let stored = Product::from_new(state.next_id, product);
        state.products.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_by_id(&self, id: i64) -> Result<Product, InventoryError> {
        let state = self.state.lock().await;
        state.products.get(&id).cloned().ok_or(InventoryError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<Product>, InventoryError> {
        Ok(self.state.lock().await.products.values().cloned().collect())
    }

    async fn update(&self, product: &Product) -> Result<(), InventoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .products
            .get_mut(&product.id)
            .ok_or(InventoryError::NotFound(product.id))?;
        *stored = product.clone();
        Ok(())
    }

    async fn reserve(&self, order_id: i64, items: &[EventItem]) -> Result<Reservation, InventoryError> {
        let mut state = self.state.lock().await;

        if state.processed_orders.contains(&order_id) {
            return Ok(Reservation::AlreadyApplied);
        }

        let lines = merge_lines(items)?;

        // Check every line before touching any row.
        for &(product_id, requested) in &lines {
            let product = state
                .products
                .get(&product_id)
                .ok_or(InventoryError::NotFound(product_id))?;
            if product.stock < requested {
                return Err(InventoryError::InsufficientStock {
                    product_id,
                    requested,
                    available: product.stock,
                });
            }
        }

        for &(product_id, requested) in &lines {
            if let Some(product) = state.products.get_mut(&product_id) {
                product.stock -= requested;
            }
        }
        state.processed_orders.insert(order_id);

        Ok(Reservation::Applied)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
