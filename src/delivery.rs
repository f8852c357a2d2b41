//! Delivery types for consumed messages.
//!
//! This module defines the message snapshot handed to job logic and
//! disposition handlers:
//!
//! - `Delivery`: One consumed message (tag, routing key, payload, headers)
//! - `Headers`: Broker headers with dead-letter history scanning

use serde_json::{Map, Value};

/// Header under which the broker records dead-letter history.
pub const X_DEATH: &str = "x-death";

/// One consumed message.
///
/// A delivery is immutable once received and is owned by a single consumer
/// task for the duration of one processing cycle. Handlers take it by value
/// when deciding its disposition, so a delivery cannot be acknowledged or
/// rejected twice.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-assigned tag used to acknowledge or reject this delivery.
    pub delivery_tag: u64,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Opaque message payload.
    pub payload: Vec<u8>,
    /// Broker headers, if the message carried any.
    pub headers: Option<Headers>,
}

impl Delivery {
    /// Creates a delivery without headers.
    pub fn new(delivery_tag: u64, routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            payload: payload.into(),
            headers: None,
        }
    }

    /// Sets the broker headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Returns how many times this message has already failed on the given
    /// queue, according to the dead-letter history. Absent headers count as
    /// zero failures.
    pub fn failure_count(&self, queue_name: &str) -> u64 {
        self.headers
            .as_ref()
            .map(|headers| headers.failure_count(queue_name))
            .unwrap_or(0)
    }
}

/// Broker headers attached to a delivery.
///
/// Headers are an open string-to-value table; the one the retry machinery
/// depends on is `x-death`, the dead-letter history the broker maintains as
/// a message bounces between queues.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Map<String, Value>);

impl Headers {
    /// Creates an empty header table.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Returns the raw value for a header, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Sets a header value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    /// Returns a reference to the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Counts prior failures for the given queue from the `x-death` history.
    ///
    /// Entries are matched by their `queue` field. When any matching entry
    /// carries a `count` field the counts present are summed; otherwise the
    /// matching entries themselves are counted. A missing, null, or
    /// malformed header yields zero.
    pub fn failure_count(&self, queue_name: &str) -> u64 {
        let deaths = match self.0.get(X_DEATH) {
            Some(Value::Array(entries)) => entries,
            _ => return 0,
        };

        let matching: Vec<&Map<String, Value>> = deaths
            .iter()
            .filter_map(Value::as_object)
            .filter(|entry| entry.get("queue").and_then(Value::as_str) == Some(queue_name))
            .collect();

        let counts: Vec<u64> = matching
            .iter()
            .filter_map(|entry| entry.get("count").and_then(Value::as_u64))
            .collect();

        if counts.is_empty() {
            matching.len() as u64
        } else {
            counts.iter().sum()
        }
    }
}

impl From<Map<String, Value>> for Headers {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
