use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::order::{merge_lines, validate_line, Order, OrderStatus};

// ============================================================================
// Domain Events
// These represent facts that have already been committed
// ============================================================================

/// Base trait for events that leave the service over the broker
pub trait DomainEvent {
    fn event_type(&self) -> &str;
    fn aggregate_id(&self) -> i64;
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Detached copy of a committed order, published for stock reservation.
///
/// Wire form (JSON):
/// `{"order_id":1,"user_id":1,"items":[{"product_id":5,"quantity":2}],"status":"pending","timestamp":"2024-01-01T00:00:00Z"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: i64,
    pub user_id: i64,
    pub items: Vec<EventItem>,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventItem {
    pub product_id: i64,
    pub quantity: i32,
}

impl EventItem {
    pub fn new(product_id: i64, quantity: i32) -> Self {
        Self { product_id, quantity }
    }
}

impl OrderCreatedEvent {
    pub fn from_order(order: &Order, timestamp: DateTime<Utc>) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id,
            items: order
                .items
                .iter()
                .map(|item| EventItem::new(item.product_id, item.quantity))
                .collect(),
            status: order.status,
            timestamp,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Rejects events that can never be applied: no lines, a line with a
    /// non-positive product id or quantity, or a product whose lines sum
    /// past `i32::MAX`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.items.is_empty() {
            return Err(ValidationError::EmptyItems);
        }
        for item in &self.items {
            validate_line(item.product_id, item.quantity)?;
        }
        self.merged_lines()?;
        Ok(())
    }

    /// Per-product totals, ordered by product id.
    pub fn merged_lines(&self) -> Result<Vec<(i64, i32)>, ValidationError> {
        merge_lines(self.items.iter().map(|item| (item.product_id, item.quantity)))
    }
}

impl DomainEvent for OrderCreatedEvent {
    fn event_type(&self) -> &str {
        "OrderCreated"
    }

    fn aggregate_id(&self) -> i64 {
        self.order_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
