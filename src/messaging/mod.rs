// ============================================================================
// Messaging
// ============================================================================
//
// The broker is reached through the `Broker` trait so that the pipeline runs
// unchanged against Redpanda (Kafka protocol) in production and against the
// in-memory broker in tests.
//
// Topology mirrors a direct exchange:
//   exchange "order_events" --[order.created]--> queue "order_events"
//                           --[order.created.dead]--> dead letters
//
// Delivery is at-least-once: a message stays owned by the broker until it is
// acknowledged, rejected or dead-lettered.
//
// ============================================================================

mod in_memory;
mod publisher;
mod redpanda;

pub use in_memory::{DeadLetter, InMemoryBroker};
pub use publisher::{EventPublisher, PublishError};
pub use redpanda::RedpandaBroker;

use async_trait::async_trait;
use uuid::Uuid;

use crate::utils::{CircuitState, IsTransient};

pub const ORDER_EVENTS_EXCHANGE: &str = "order_events";
pub const ORDER_EVENTS_QUEUE: &str = "order_events";
pub const ORDER_CREATED_ROUTING_KEY: &str = "order.created";
pub const DEAD_LETTER_ROUTING_KEY: &str = "order.created.dead";

/// Names of the exchange, queue and routing keys the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_routing_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: ORDER_EVENTS_EXCHANGE.to_string(),
            queue: ORDER_EVENTS_QUEUE.to_string(),
            routing_key: ORDER_CREATED_ROUTING_KEY.to_string(),
            dead_letter_routing_key: DEAD_LETTER_ROUTING_KEY.to_string(),
        }
    }
}

impl Topology {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Topic used for dead letters on log-based brokers.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: Uuid,
    /// Partitioning key (the order id for order events).
    pub key: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Broker must store the message durably before confirming the publish.
    pub persistent: bool,
    /// How many times this message has been handed to a consumer,
    /// including the current delivery. Zero until first delivered.
    pub delivery_count: u32,
}

impl Message {
    pub fn persistent(routing_key: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            key: key.into(),
            routing_key: routing_key.into(),
            payload,
            persistent: true,
            delivery_count: 0,
        }
    }
}

/// A received message plus the broker handle needed to settle it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub(crate) tag: DeliveryTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryTag {
    Memory(u64),
    Kafka {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

impl Delivery {
    pub fn delivery_count(&self) -> u32 {
        self.message.delivery_count
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("circuit breaker open, broker unavailable")]
    CircuitOpen,

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("broker is closed")]
    Closed,

    #[error("broker refused message: {0}")]
    Rejected(String),

    #[error("delivery {0} is not outstanding")]
    UnknownDelivery(String),

    #[error("broker was built without a consumer")]
    NoConsumer,
}

impl IsTransient for BrokerError {
    /// A refused message is refused again on every attempt. Outages, an open
    /// breaker and other client errors clear up on their own.
    fn is_transient(&self) -> bool {
        use rdkafka::types::RDKafkaErrorCode;

        match self {
            BrokerError::Rejected(_) => false,
            BrokerError::Kafka(e) => !matches!(
                e.rdkafka_error_code(),
                Some(RDKafkaErrorCode::MessageSizeTooLarge | RDKafkaErrorCode::InvalidMessageSize)
            ),
            _ => true,
        }
    }
}

// ============================================================================
// Broker Trait
// ============================================================================

#[async_trait]
pub trait Broker: Send + Sync {
    /// Returns once the broker has durably accepted the message.
    async fn publish(&self, message: Message) -> Result<(), BrokerError>;

    /// Waits for the next message on the bound queue.
    async fn receive(&self) -> Result<Delivery, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Negative acknowledgement. With `requeue` the message is delivered
    /// again later with its delivery count carried forward.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Moves the message to the dead-letter destination and settles it.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;

    async fn circuit_state(&self) -> CircuitState {
        CircuitState::Closed
    }
}
