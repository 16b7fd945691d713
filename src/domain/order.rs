use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::ValidationError;

// ============================================================================
// Order Value Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
    /// Stock could not be reserved and the order awaits manual resolution.
    OnHold,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::OnHold => "on_hold",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownOrderStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownOrderStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "on_hold" => Ok(OrderStatus::OnHold),
            other => Err(UnknownOrderStatus(other.to_string())),
        }
    }
}

// ============================================================================
// Persisted Order
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

/// A line of an order. Lives only as a child of its `Order` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i32,
}

// ============================================================================
// Order Placement Input
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub user_id: i64,
    pub items: Vec<NewOrderItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_id: i64,
    pub quantity: i32,
}

impl NewOrder {
    pub fn new(user_id: i64, items: Vec<NewOrderItem>) -> Self {
        Self { user_id, items }
    }

    /// Checks the order before anything touches storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id <= 0 {
            return Err(ValidationError::InvalidUserId(self.user_id));
        }
        if self.items.is_empty() {
            return Err(ValidationError::EmptyItems);
        }
        for item in &self.items {
            validate_line(item.product_id, item.quantity)?;
        }
        merge_lines(self.items.iter().map(|item| (item.product_id, item.quantity)))?;
        Ok(())
    }
}

impl NewOrderItem {
    pub fn new(product_id: i64, quantity: i32) -> Self {
        Self { product_id, quantity }
    }
}

/// Shared rule for a single order line: both ids and quantities are positive.
pub fn validate_line(product_id: i64, quantity: i32) -> Result<(), ValidationError> {
    if product_id <= 0 {
        return Err(ValidationError::InvalidProductId(product_id));
    }
    if quantity <= 0 {
        return Err(ValidationError::InvalidQuantity { product_id, quantity });
    }
    Ok(())
}

/// Sums quantities per product, ordered by product id so that row locks are
/// always taken in the same order. Fails when a product's total does not fit
/// in a stock column.
pub fn merge_lines(lines: impl IntoIterator<Item = (i64, i32)>) -> Result<Vec<(i64, i32)>, ValidationError> {
    let mut merged = std::collections::BTreeMap::<i64, i32>::new();
    for (product_id, quantity) in lines {
        let total = merged.entry(product_id).or_insert(0);
        *total = total
            .checked_add(quantity)
            .ok_or(ValidationError::QuantityOverflow(product_id))?;
    }
    Ok(merged.into_iter().collect())
}

// ============================================================================
// Unit Tests
// ============================================================================
