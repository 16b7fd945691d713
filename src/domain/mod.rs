// ============================================================================
// Domain Layer
// ============================================================================
//
// Plain data types shared by the stores, the broker adapters and the
// pipeline:
// - Orders and their line items
// - Products and their stock
// - The "order created" event that travels over the broker
// - Validation rules for order lines
//
// Nothing in here performs I/O.
//
// ============================================================================

pub mod errors;
pub mod events;
pub mod order;
pub mod product;

pub use errors::*;
pub use events::*;
pub use order::*;
pub use product::*;
