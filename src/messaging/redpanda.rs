use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::{BorrowedMessage, Header, Headers, Message as KafkaMessage, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
    Offset, TopicPartitionList,
};
use std::time::Duration;
use uuid::Uuid;

use super::{Broker, BrokerError, Delivery, DeliveryTag, Message, Topology};
use crate::config::BrokerConfig;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

// ============================================================================
// Redpanda Broker - Kafka-protocol adapter
// ============================================================================
//
// Maps the queue semantics onto a log:
// - queue        -> topic `topology.queue`, record key = message key
// - persistent   -> acks=all + idempotent producer
// - ack          -> synchronous commit of offset + 1
// - requeue      -> republish with x-delivery-count carried, then commit
// - dead-letter  -> publish to `<queue>.dlq` with x-death-reason, then commit
//
// Every produce goes through the circuit breaker.
//
// ============================================================================

const HEADER_ROUTING_KEY: &str = "routing-key";
const HEADER_MESSAGE_ID: &str = "message-id";
const HEADER_DELIVERY_MODE: &str = "delivery-mode";
const HEADER_DELIVERY_COUNT: &str = "x-delivery-count";
const HEADER_DEATH_REASON: &str = "x-death-reason";

/// Acks return only once the group coordinator has stored the offset, so an
/// acknowledged message is not redelivered after a crash.
const ACK_COMMIT_MODE: CommitMode = CommitMode::Sync;

pub struct RedpandaBroker {
    producer: FutureProducer,
    consumer: Option<StreamConsumer>,
    circuit_breaker: CircuitBreaker,
    topology: Topology,
    send_timeout: Duration,
}

impl RedpandaBroker {
    /// Publish-only client, used by order placement and the outbox relay.
    pub fn producer(config: &BrokerConfig, topology: Topology) -> Result<Self, BrokerError> {
        Ok(Self {
            producer: build_producer(config)?,
            consumer: None,
            circuit_breaker: CircuitBreaker::new("redpanda", circuit_breaker_config()),
            topology,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        })
    }

    /// Client subscribed to the order queue. Each consumer worker gets its own
    /// instance; the group spreads partitions across them.
    pub fn consumer(config: &BrokerConfig, topology: Topology) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[topology.queue.as_str()])?;

        tracing::info!(
            topic = %topology.queue,
            group = %config.consumer_group,
            "Subscribed to order events"
        );

        Ok(Self {
            producer: build_producer(config)?,
            consumer: Some(consumer),
            circuit_breaker: CircuitBreaker::new("redpanda", circuit_breaker_config()),
            topology,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        })
    }

    fn topic_for(&self, routing_key: &str) -> String {
        if routing_key == self.topology.dead_letter_routing_key {
            self.topology.dead_letter_queue()
        } else {
            self.topology.queue.clone()
        }
    }

    async fn produce(
        &self,
        topic: &str,
        message: &Message,
        death_reason: Option<&str>,
    ) -> Result<(), BrokerError> {
        let message_id = message.message_id.to_string();
        let delivery_count = message.delivery_count.to_string();
        let delivery_mode = if message.persistent { "persistent" } else { "transient" };

        let mut headers = OwnedHeaders::new()
            .insert(Header { key: HEADER_ROUTING_KEY, value: Some(message.routing_key.as_str()) })
            .insert(Header { key: HEADER_MESSAGE_ID, value: Some(message_id.as_str()) })
            .insert(Header { key: HEADER_DELIVERY_MODE, value: Some(delivery_mode) })
            .insert(Header { key: HEADER_DELIVERY_COUNT, value: Some(delivery_count.as_str()) });
        if let Some(reason) = death_reason {
            headers = headers.insert(Header { key: HEADER_DEATH_REASON, value: Some(reason) });
        }

        let result = self
            .circuit_breaker
            .call(async {
                let record = FutureRecord::to(topic)
                    .key(&message.key)
                    .payload(&message.payload)
                    .headers(headers);

                self.producer
                    .send(record, Timeout::After(self.send_timeout))
                    .await
                    .map(|_| ())
                    .map_err(|(e, _)| e)
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    topic = %topic,
                    key = %message.key,
                    message_id = %message.message_id,
                    "Published to Redpanda"
                );
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(topic = %topic, "Circuit breaker open - Redpanda unavailable");
                Err(BrokerError::CircuitOpen)
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, topic = %topic, "Failed to publish to Redpanda");
                Err(BrokerError::Kafka(e))
            }
        }
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let consumer = self.consumer.as_ref().ok_or(BrokerError::NoConsumer)?;
        let DeliveryTag::Kafka { topic, partition, offset } = &delivery.tag else {
            return Err(BrokerError::UnknownDelivery(format!("{:?}", delivery.tag)));
        };

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))?;
        consumer.commit(&offsets, ACK_COMMIT_MODE)?;
        Ok(())
    }
}

fn build_producer(config: &BrokerConfig) -> Result<FutureProducer, KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("message.timeout.ms", config.send_timeout_ms.to_string())
        .create()
}

fn circuit_breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 5,
        timeout: Duration::from_secs(30),
        success_threshold: 3,
    }
}

fn header_value<'a>(message: &'a BorrowedMessage<'a>, name: &str) -> Option<&'a str> {
    message
        .headers()?
        .iter()
        .find(|header| header.key == name)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    let previous_deliveries = header_value(message, HEADER_DELIVERY_COUNT)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let message_id = header_value(message, HEADER_MESSAGE_ID)
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4);
    let routing_key = header_value(message, HEADER_ROUTING_KEY)
        .unwrap_or_default()
        .to_string();
    let persistent = header_value(message, HEADER_DELIVERY_MODE) != Some("transient");

    Delivery {
        message: Message {
            message_id,
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default(),
            routing_key,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            persistent,
            delivery_count: previous_deliveries + 1,
        },
        tag: DeliveryTag::Kafka {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        },
    }
}

#[async_trait]
impl Broker for RedpandaBroker {
    async fn publish(&self, message: Message) -> Result<(), BrokerError> {
        let topic = self.topic_for(&message.routing_key);
        self.produce(&topic, &message, None).await
    }

    async fn receive(&self) -> Result<Delivery, BrokerError> {
        let consumer = self.consumer.as_ref().ok_or(BrokerError::NoConsumer)?;
        let message = consumer.recv().await?;
        Ok(to_delivery(&message))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.commit(delivery)
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            // The republished copy carries the current count; the next
            // receive adds one.
            self.produce(&self.topology.queue, &delivery.message, None).await?;
        }
        self.commit(delivery)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let topic = self.topology.dead_letter_queue();
        let mut message = delivery.message.clone();
        message.routing_key = self.topology.dead_letter_routing_key.clone();
        self.produce(&topic, &message, Some(reason)).await?;
        self.commit(delivery)
    }

    async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.get_state().await
    }
}
