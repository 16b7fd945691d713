//! In-memory broker for tests and single-process runs.
//!
//! Behaves like a durable direct exchange bound to one queue:
//! - messages published with the bound routing key are queued FIFO
//! - messages published with the dead-letter routing key land in the
//!   dead-letter list
//! - anything else is unroutable and dropped
//! - a rejected-with-requeue message goes back to the head of the queue
//!   with its delivery count preserved
//! - payloads above `max_message_bytes` are refused, like a log broker's
//!   message size limit

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use super::{Broker, BrokerError, Delivery, DeliveryTag, Message, Topology};

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    topology: Topology,
    max_message_bytes: Option<usize>,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    acked: Vec<Message>,
    dead_letters: Vec<DeadLetter>,
    next_tag: u64,
    closed: bool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Topology::default())
    }
}

impl InMemoryBroker {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            max_message_bytes: None,
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = Some(limit);
        self
    }

    /// Non-blocking receive, `None` when the queue is empty.
    pub async fn try_receive(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        Self::take_next(&mut state)
    }

    /// Wakes every waiting receiver; `receive` fails with `Closed` once the
    /// queue is drained.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Accepts publishes again after `close`.
    pub async fn reopen(&self) {
        self.state.lock().await.closed = false;
    }

    pub async fn ready_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    pub async fn acked(&self) -> Vec<Message> {
        self.state.lock().await.acked.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Messages still waiting for a consumer, head first.
    pub async fn ready_messages(&self) -> Vec<Message> {
        self.state.lock().await.ready.iter().cloned().collect()
    }

    fn take_next(state: &mut BrokerState) -> Option<Delivery> {
        let mut message = state.ready.pop_front()?;
        message.delivery_count += 1;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, message.clone());
        Some(Delivery {
            message,
            tag: DeliveryTag::Memory(tag),
        })
    }

    async fn settle(&self, delivery: &Delivery) -> Result<Message, BrokerError> {
        let DeliveryTag::Memory(tag) = delivery.tag else {
            return Err(BrokerError::UnknownDelivery(format!("{:?}", delivery.tag)));
        };
        let mut state = self.state.lock().await;
        state
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.to_string()))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: Message) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if let Some(limit) = self.max_message_bytes {
            if message.payload.len() > limit {
                return Err(BrokerError::Rejected(format!(
                    "payload of {} bytes exceeds {} byte limit",
                    message.payload.len(),
                    limit
                )));
            }
        }

        if message.routing_key == self.topology.routing_key {
            tracing::debug!(
                message_id = %message.message_id,
                key = %message.key,
                queue = %self.topology.queue,
                "Queued message"
            );
            state.ready.push_back(message);
            drop(state);
            self.notify.notify_one();
        } else if message.routing_key == self.topology.dead_letter_routing_key {
            state.dead_letters.push(DeadLetter {
                message,
                reason: "published to dead-letter routing key".to_string(),
            });
        } else {
            tracing::warn!(
                routing_key = %message.routing_key,
                exchange = %self.topology.exchange,
                "Dropping unroutable message"
            );
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, BrokerError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(delivery) = Self::take_next(&mut state) {
                    return Ok(delivery);
                }
                if state.closed {
                    return Err(BrokerError::Closed);
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let message = self.settle(delivery).await?;
        self.state.lock().await.acked.push(message);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let message = self.settle(delivery).await?;
        if requeue {
            self.state.lock().await.ready.push_front(message);
            self.notify.notify_one();
        } else {
            tracing::warn!(
                message_id = %message.message_id,
                "Discarding rejected message"
            );
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let message = self.settle(delivery).await?;
        self.state.lock().await.dead_letters.push(DeadLetter {
            message,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
