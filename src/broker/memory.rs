//! In-memory broker implementation.
//!
//! This module provides a complete in-process [`BrokerChannel`] used by the
//! test suites and for local development. It models the slice of broker
//! behavior the worker core depends on:
//!
//! - Topic routing (`#` wildcard and exact keys; the full topic grammar
//!   with `*` segments is not implemented)
//! - Idempotent declares and deduplicated bindings
//! - Competing consumers pulling from a shared queue
//! - Unacked-delivery tracking; unknown tags are errors
//! - Dead-lettering through `x-dead-letter-exchange`, with `x-death`
//!   history maintained the way the broker maintains it
//! - Per-queue TTL expiry (`x-message-ttl`), which is what drives the
//!   retry queue's delay

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::broker::channel::{
    BrokerChannel, BrokerError, ConsumeOptions, ExchangeKind, ExchangeOptions, QueueOptions,
    Subscription,
};
use crate::delivery::{Delivery, Headers, X_DEATH};

/// In-process message broker.
///
/// Cloning is cheap; clones share the same broker state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of messages sitting in a queue.
    ///
    /// Unknown queues report zero.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Returns the payloads currently sitting in a queue, front first.
    pub async fn peek_queue(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the number of deliveries handed out but not yet settled.
    pub async fn unacked_len(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.unacked.len()
    }

    /// Places a message directly into a queue, bypassing exchanges.
    ///
    /// Useful for crafting deliveries with specific headers, such as a
    /// prepared `x-death` history. The queue is declared with default
    /// options if it does not exist yet.
    pub async fn deliver(
        &self,
        queue: &str,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        headers: Option<Headers>,
    ) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(QueueOptions::default()));

        let id = state.next_message_id;
        state.next_message_id += 1;

        let message = Message {
            id,
            routing_key: routing_key.into(),
            payload: payload.into(),
            headers: headers.map(|h| h.as_map().clone()),
        };

        enqueue(&self.inner, state, queue, message, false);
    }

    /// Cancels every consumer registered on a queue, as a broker would when
    /// tearing a consumer down on its side.
    pub async fn cancel_consumers(&self, queue: &str) {
        let state = self.inner.state.lock().await;
        if let Some(q) = state.queues.get(queue) {
            for consumer in &q.consumers {
                consumer.cancelled.store(true, Ordering::SeqCst);
            }
            q.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState::new(options.clone()));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                reason: "no such queue".to_string(),
            });
        }

        let entry = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                reason: "no such exchange".to_string(),
            })?;

        let exists = entry
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            entry.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let id = state.next_message_id;
        state.next_message_id += 1;

        let message = Message {
            id,
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            headers: None,
        };

        let delivered = route(&self.inner, state, exchange, routing_key, message)?;
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            queues = delivered,
            "Message published"
        );
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let pending = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;

        if requeue {
            enqueue(&self.inner, state, &pending.queue, pending.message, true);
        } else {
            dead_letter(&self.inner, state, &pending.queue, pending.message, "rejected");
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Arc<dyn Subscription>, BrokerError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let tag = if options.consumer_tag.is_empty() {
            let n = state.next_consumer_id;
            state.next_consumer_id += 1;
            format!("ctag-{}", n)
        } else {
            options.consumer_tag.clone()
        };

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: "no such queue".to_string(),
            });
        };

        let active: Vec<&Arc<ConsumerState>> = queue_state
            .consumers
            .iter()
            .filter(|c| !c.cancelled.load(Ordering::SeqCst))
            .collect();

        if options.exclusive && !active.is_empty() {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: "queue already has consumers".to_string(),
            });
        }
        if active.iter().any(|c| c.exclusive) {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: "queue is held by an exclusive consumer".to_string(),
            });
        }

        let consumer = Arc::new(ConsumerState {
            tag,
            exclusive: options.exclusive,
            cancelled: AtomicBool::new(false),
        });
        queue_state.consumers.push(Arc::clone(&consumer));

        let subscription = MemorySubscription {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            notify: Arc::clone(&queue_state.notify),
            consumer,
        };

        Ok(Arc::new(subscription))
    }
}

/// Pull handle over one queue.
struct MemorySubscription {
    inner: Arc<Inner>,
    queue: String,
    notify: Arc<Notify>,
    consumer: Arc<ConsumerState>,
}

impl MemorySubscription {
    /// Takes the front message if one is waiting, registering it as unacked.
    async fn try_take(&self) -> Option<Delivery> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let queue = state.queues.get_mut(&self.queue)?;
        let message = queue.messages.pop_front()?;

        let tag = state.next_delivery_tag;
        state.next_delivery_tag += 1;
        state.unacked.insert(
            tag,
            PendingDelivery {
                queue: self.queue.clone(),
                message: message.clone(),
            },
        );

        Some(Delivery {
            delivery_tag: tag,
            routing_key: message.routing_key,
            payload: message.payload,
            headers: message.headers.map(Headers::from),
        })
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&self) -> Option<Delivery> {
        loop {
            if self.is_cancelled() {
                return None;
            }

            // Register interest before checking the queue so an enqueue
            // between the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take().await {
                return Some(delivery);
            }
            if self.is_cancelled() {
                return None;
            }

            notified.await;
        }
    }

    async fn cancel(&self) -> Result<(), BrokerError> {
        self.consumer.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        debug!(queue = %self.queue, consumer_tag = %self.consumer.tag, "Consumer cancelled");
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.consumer.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, PendingDelivery>,
    next_delivery_tag: u64,
    next_message_id: u64,
    next_consumer_id: u64,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueState {
    messages: VecDeque<Message>,
    options: QueueOptions,
    notify: Arc<Notify>,
    consumers: Vec<Arc<ConsumerState>>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            messages: VecDeque::new(),
            options,
            notify: Arc::new(Notify::new()),
            consumers: Vec::new(),
        }
    }

    fn message_ttl(&self) -> Option<Duration> {
        let has_dlx = self
            .options
            .arguments
            .get("x-dead-letter-exchange")
            .and_then(Value::as_str)
            .is_some();
        if !has_dlx {
            return None;
        }
        self.options
            .arguments
            .get("x-message-ttl")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }
}

struct ConsumerState {
    tag: String,
    exclusive: bool,
    cancelled: AtomicBool,
}

#[derive(Clone)]
struct Message {
    id: u64,
    routing_key: String,
    payload: Vec<u8>,
    headers: Option<Map<String, Value>>,
}

struct PendingDelivery {
    queue: String,
    message: Message,
}

/// Routes a message through an exchange, returning how many queues took it.
///
/// Unroutable messages are dropped, matching non-mandatory publish
/// semantics; only a missing exchange is an error.
fn route(
    inner: &Arc<Inner>,
    state: &mut BrokerState,
    exchange: &str,
    routing_key: &str,
    message: Message,
) -> Result<usize, BrokerError> {
    let entry = state
        .exchanges
        .get(exchange)
        .ok_or_else(|| BrokerError::Publish {
            exchange: exchange.to_string(),
            reason: "no such exchange".to_string(),
        })?;

    let targets: Vec<String> = entry
        .bindings
        .iter()
        .filter(|b| key_matches(entry.kind, &b.routing_key, routing_key))
        .map(|b| b.queue.clone())
        .collect();

    for queue in &targets {
        enqueue(inner, state, queue, message.clone(), false);
    }

    Ok(targets.len())
}

/// Places a message into a queue and wakes its consumers. Entering a queue
/// with a dead-letter TTL schedules the message's expiry.
fn enqueue(inner: &Arc<Inner>, state: &mut BrokerState, queue_name: &str, message: Message, front: bool) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    let ttl = queue.message_ttl();
    let message_id = message.id;

    if front {
        queue.messages.push_front(message);
    } else {
        queue.messages.push_back(message);
    }
    queue.notify.notify_waiters();

    if let Some(ttl) = ttl {
        schedule_expiry(Arc::clone(inner), queue_name.to_string(), message_id, ttl);
    }
}

/// Routes a message that died in `source_queue` through the queue's
/// dead-letter exchange, recording the death in `x-death`. Messages from
/// queues without a dead-letter exchange are dropped.
fn dead_letter(
    inner: &Arc<Inner>,
    state: &mut BrokerState,
    source_queue: &str,
    mut message: Message,
    reason: &str,
) {
    let target = state
        .queues
        .get(source_queue)
        .and_then(|q| q.options.arguments.get("x-dead-letter-exchange"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(exchange) = target else {
        debug!(queue = %source_queue, reason = %reason, "Message dropped without dead-letter exchange");
        return;
    };

    let mut headers = message.headers.take().unwrap_or_default();
    record_death(&mut headers, source_queue, reason);
    message.headers = Some(headers);

    let routing_key = message.routing_key.clone();
    if state.exchanges.contains_key(&exchange) {
        let _ = route(inner, state, &exchange, &routing_key, message);
        debug!(
            queue = %source_queue,
            exchange = %exchange,
            reason = %reason,
            "Message dead-lettered"
        );
    } else {
        debug!(exchange = %exchange, "Dead-letter exchange missing, message dropped");
    }
}

/// Records one death in the `x-death` header: the entry matching this
/// queue and reason has its count incremented, otherwise a new entry is
/// prepended.
fn record_death(headers: &mut Map<String, Value>, queue: &str, reason: &str) {
    let deaths = headers
        .entry(X_DEATH.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(entries) = deaths else {
        return;
    };

    for entry in entries.iter_mut() {
        if let Value::Object(map) = entry {
            let same_queue = map.get("queue").and_then(Value::as_str) == Some(queue);
            let same_reason = map.get("reason").and_then(Value::as_str) == Some(reason);
            if same_queue && same_reason {
                let count = map.get("count").and_then(Value::as_u64).unwrap_or(0);
                map.insert("count".to_string(), json!(count + 1));
                return;
            }
        }
    }

    entries.insert(0, json!({ "queue": queue, "reason": reason, "count": 1 }));
}

fn key_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => pattern == "#" || pattern == routing_key,
    }
}

fn schedule_expiry(inner: Arc<Inner>, queue: String, message_id: u64, ttl: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        expire(inner, queue, message_id).await;
    });
}

async fn expire(inner: Arc<Inner>, queue_name: String, message_id: u64) {
    let mut guard = inner.state.lock().await;
    let state = &mut *guard;

    let Some(queue) = state.queues.get_mut(&queue_name) else {
        return;
    };
    let Some(position) = queue.messages.iter().position(|m| m.id == message_id) else {
        return;
    };
    let Some(message) = queue.messages.remove(position) else {
        return;
    };

    dead_letter(&inner, state, &queue_name, message, "expired");
}
