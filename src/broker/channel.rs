//! Broker channel abstraction.
//!
//! The worker reaches the broker exclusively through the narrow traits in
//! this module. Connection bootstrap, credentials, and transport framing
//! belong to the adapter implementation, not to this crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::delivery::Delivery;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Declaring an exchange failed.
    #[error("Exchange declare failed for '{name}': {reason}")]
    ExchangeDeclare { name: String, reason: String },

    /// Declaring a queue failed.
    #[error("Queue declare failed for '{name}': {reason}")]
    QueueDeclare { name: String, reason: String },

    /// Binding a queue to an exchange failed.
    #[error("Bind failed for queue '{queue}' to exchange '{exchange}': {reason}")]
    Bind {
        queue: String,
        exchange: String,
        reason: String,
    },

    /// Publishing a message failed.
    #[error("Publish to exchange '{exchange}' failed: {reason}")]
    Publish { exchange: String, reason: String },

    /// Registering a consumer failed.
    #[error("Consume failed for queue '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    /// An acknowledge or reject referenced a tag the channel does not know.
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    /// The channel is no longer usable.
    #[error("Channel closed")]
    Closed,
}

/// The exchange types the worker declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Pattern-matched routing; the retry topology uses topic exchanges.
    Topic,
    /// Exact routing-key match.
    Direct,
    /// Delivers to every bound queue.
    Fanout,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeKind::Topic => write!(f, "topic"),
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Options for declaring an exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    /// Whether the exchange survives a broker restart.
    pub durable: bool,
    /// Whether the exchange is removed once unused.
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Options for declaring a queue.
///
/// `arguments` is the open table broker extensions read from; the retry
/// topology uses it for `x-dead-letter-exchange` and `x-message-ttl`.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// Whether the queue is removed once unused.
    pub auto_delete: bool,
    /// Broker-specific queue arguments.
    pub arguments: Map<String, Value>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            arguments: Map::new(),
        }
    }
}

impl QueueOptions {
    /// Creates options with the given durability flags and no arguments.
    pub fn new(durable: bool, auto_delete: bool) -> Self {
        Self {
            durable,
            auto_delete,
            arguments: Map::new(),
        }
    }

    /// Adds a broker-specific queue argument.
    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }
}

/// Options for registering a consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Identifier for the consumer; empty means the adapter picks one.
    pub consumer_tag: String,
    /// Whether this consumer demands sole access to the queue.
    pub exclusive: bool,
}

/// A channel to the message broker.
///
/// Implementations must be safe to share across consumer tasks; every
/// operation takes `&self` and may be called concurrently. Consumed
/// deliveries are acknowledged manually through [`ack`](Self::ack) and
/// [`reject`](Self::reject).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares an exchange. Declaring an existing exchange is a no-op.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError>;

    /// Declares a queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    /// Binds a queue to an exchange under a routing key pattern.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes a message to an exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;

    /// Acknowledges a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Rejects a delivery, optionally requeueing it.
    ///
    /// When `requeue` is false and the source queue carries a
    /// dead-letter-exchange argument, the broker routes the message there.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Registers a consumer on a queue.
    ///
    /// The returned subscription is shared by every consumer task of a
    /// worker; tasks pull competing deliveries from it.
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Arc<dyn Subscription>, BrokerError>;
}

/// A registered consumer pulling deliveries from one queue.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Waits for the next delivery.
    ///
    /// Returns `None` once the subscription has been cancelled, either
    /// locally or by the broker. No delivery is handed out after
    /// cancellation.
    async fn next(&self) -> Option<Delivery>;

    /// Cancels the subscription. In-flight processing is unaffected.
    async fn cancel(&self) -> Result<(), BrokerError>;

    /// Returns whether the subscription has been cancelled.
    fn is_cancelled(&self) -> bool;
}
