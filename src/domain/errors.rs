// ============================================================================
// Order Validation Errors
// ============================================================================

/// Rule violations detected before an order is persisted or before an
/// event is applied to inventory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid user ID {0}")]
    InvalidUserId(i64),

    #[error("order must have at least one item")]
    EmptyItems,

    #[error("invalid product ID {0}")]
    InvalidProductId(i64),

    #[error("invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: i64, quantity: i32 },

    #[error("total quantity for product {0} exceeds the supported range")]
    QuantityOverflow(i64),
}
