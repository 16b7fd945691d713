// ============================================================================
// Persistence Seams
// ============================================================================
//
// Three stores back the pipeline:
// - OrderStore     - orders + items, written as one unit
// - OutboxStore    - "order created" rows written with the order, relayed later
// - InventoryStore - product rows and stock mutation
//
// Each has an in-memory implementation (tests, single process) and a
// Postgres implementation built on sqlx.
//
// ============================================================================

mod memory;
pub mod postgres;

pub use memory::{InMemoryInventoryStore, InMemoryOrderStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{EventItem, NewOrder, NewProduct, Order, OrderStatus, Product, ValidationError};
use crate::utils::IsTransient;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderStoreError {
    #[error("order {0} not found")]
    NotFound(i64),

    #[error("outbox record {0} not found")]
    OutboxRecordNotFound(i64),

    #[error("order persistence failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize order event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored order has invalid status: {0}")]
    CorruptStatus(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("product {0} not found")]
    NotFound(i64),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: i64,
        requested: i32,
        available: i32,
    },

    #[error("invalid reservation: {0}")]
    Invalid(#[from] ValidationError),

    #[error("inventory storage failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl IsTransient for InventoryError {
    /// Only storage failures are worth an immediate retry; a missing product
    /// or short stock will not change within a backoff window.
    fn is_transient(&self) -> bool {
        matches!(self, InventoryError::Database(_))
    }
}

// ============================================================================
// Outbox Records
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub order_id: i64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// Result of an atomic reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Stock for every line was decremented in one unit.
    Applied,
    /// The order was reserved before; nothing changed.
    AlreadyApplied,
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists the order row and every item row atomically, status `pending`.
    /// When `with_outbox` is set, the serialized `OrderCreatedEvent` is written
    /// to the outbox inside the same transaction.
    async fn create(&self, order: NewOrder, with_outbox: bool) -> Result<Order, OrderStoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Order, OrderStoreError>;

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Order>, OrderStoreError>;

    async fn update_status(&self, id: i64, status: OrderStatus) -> Result<(), OrderStoreError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unpublished, not failed records, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OrderStoreError>;

    async fn mark_published(&self, id: i64) -> Result<(), OrderStoreError>;

    /// Bumps the attempt counter and returns its new value.
    async fn record_failure(&self, id: i64, error: &str) -> Result<i32, OrderStoreError>;

    /// Parks the record; the relay never picks it up again.
    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), OrderStoreError>;
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn create(&self, product: NewProduct) -> Result<Product, InventoryError>;

    async fn get_by_id(&self, id: i64) -> Result<Product, InventoryError>;

    async fn list(&self) -> Result<Vec<Product>, InventoryError>;

    /// Blind overwrite of every column of the stored row.
    ///
    /// Two callers that read the same stock and both write back a decremented
    /// value lose one of the decrements. Use `reserve` for stock changes.
    async fn update(&self, product: &Product) -> Result<(), InventoryError>;

    /// Decrements stock for every line of `order_id` as one unit.
    ///
    /// Lines naming the same product are summed. Either every line is
    /// applied or none is. An order that was already reserved returns
    /// `Reservation::AlreadyApplied` without touching stock.
    async fn reserve(&self, order_id: i64, items: &[EventItem]) -> Result<Reservation, InventoryError>;
}

/// Per-product totals for a reservation, ordered by product id.
pub(crate) fn merge_lines(items: &[EventItem]) -> Result<Vec<(i64, i32)>, InventoryError> {
    Ok(crate::domain::merge_lines(
        items.iter().map(|item| (item.product_id, item.quantity)),
    )?)
}
