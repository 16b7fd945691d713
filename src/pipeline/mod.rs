// ============================================================================
// Reservation Pipeline
// ============================================================================
//
//   OrderService::place_order
//        |  (one transaction: order + items [+ outbox row])
//        v
//   direct publish  --or--  OutboxRelay
//        |                      |
//        +--------> Broker <----+
//                     |
//                     v
//   ConsumerPool -> StockConsumer -> InventoryStore
//                     |
//                     +-> ack | requeue | dead-letter (+ order compensation)
//
// ============================================================================

mod compensation;
mod order_service;
mod outbox_relay;
mod pool;
mod stock_consumer;

pub use order_service::{OrderService, OrderServiceError};
pub use outbox_relay::{OutboxRelay, RelayStats};
pub use pool::ConsumerPool;
pub use stock_consumer::{ConsumeError, Disposition, StockConsumer};
