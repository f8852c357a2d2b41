//! Retry topology management.
//!
//! Bounded retry is implemented entirely in broker topology, never in
//! process state. For a worker queue `q` the topology is:
//!
//! ```text
//!   q  ──reject──▶  q-retry (exchange) ──▶ q-retry (queue, TTL + DLX)
//!   ▲                                            │ expired
//!   └──── q-retry-requeue (exchange)  ◀──────────┘
//!
//!   retries exhausted:  error record ──▶ q-error (exchange) ──▶ q-error (queue)
//! ```
//!
//! The worker queue's own `x-dead-letter-exchange` argument points at the
//! retry exchange, so a plain `reject(requeue: false)` is all it takes to
//! start a delayed redelivery. A message that sat out the retry queue's TTL
//! dead-letters into the requeue exchange and flows back to the worker
//! queue; the attempt count is carried in the broker's `x-death` header, so
//! a worker restart loses nothing.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::broker::{BrokerChannel, BrokerError, ExchangeKind, ExchangeOptions, QueueOptions};
use crate::config::WorkerConfig;

/// Errors that can occur while establishing the retry topology.
///
/// Any declaration failure is fatal to worker startup.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A declare or bind failed.
    #[error("Failed to establish retry topology for queue '{queue}': {source}")]
    Declare {
        queue: String,
        #[source]
        source: BrokerError,
    },
}

/// The named pieces of one worker queue's retry cascade.
///
/// Built once at worker construction and shared read-only afterwards. The
/// retry and error queues are named after their exchanges.
#[derive(Debug, Clone)]
pub struct RetryTopology {
    queue: String,
    retry_name: String,
    error_name: String,
    requeue_name: String,
    max_retries: u32,
    retry_ttl: Duration,
    durable: bool,
}

impl RetryTopology {
    /// Derives the topology for a worker queue.
    ///
    /// Names default to `<queue>-retry`, `<queue>-error`, and
    /// `<queue>-retry-requeue`; the configuration can override each.
    pub fn new(queue_name: impl Into<String>, config: &WorkerConfig) -> Self {
        let queue = queue_name.into();
        let retry_name = config
            .retry_exchange
            .clone()
            .unwrap_or_else(|| format!("{}-retry", queue));
        let error_name = config
            .retry_error_exchange
            .clone()
            .unwrap_or_else(|| format!("{}-error", queue));
        let requeue_name = config
            .retry_requeue_exchange
            .clone()
            .unwrap_or_else(|| format!("{}-retry-requeue", queue));

        Self {
            queue,
            retry_name,
            error_name,
            requeue_name,
            max_retries: config.retry_max_times,
            retry_ttl: config.retry_timeout,
            durable: config.durable,
        }
    }

    /// Declares the exchanges, queues, and bindings of the cascade.
    ///
    /// Safe to run repeatedly; declares are idempotent. The worker queue
    /// itself must already exist, since it gets bound to the requeue
    /// exchange here.
    pub async fn establish(&self, channel: &dyn BrokerChannel) -> Result<(), TopologyError> {
        let exchange_options = ExchangeOptions {
            durable: self.durable,
            auto_delete: false,
        };

        for exchange in [&self.retry_name, &self.error_name, &self.requeue_name] {
            channel
                .declare_exchange(exchange, ExchangeKind::Topic, &exchange_options)
                .await
                .map_err(|source| self.declare_error(source))?;
        }

        // The retry queue holds rejected messages for the configured delay,
        // then dead-letters them into the requeue exchange.
        let retry_queue_options = QueueOptions::new(self.durable, false)
            .with_argument("x-dead-letter-exchange", json!(self.requeue_name))
            .with_argument("x-message-ttl", json!(self.retry_ttl.as_millis() as u64));
        channel
            .declare_queue(&self.retry_name, &retry_queue_options)
            .await
            .map_err(|source| self.declare_error(source))?;
        channel
            .bind_queue(&self.retry_name, &self.retry_name, "#")
            .await
            .map_err(|source| self.declare_error(source))?;

        let error_queue_options = QueueOptions::new(self.durable, false);
        channel
            .declare_queue(&self.error_name, &error_queue_options)
            .await
            .map_err(|source| self.declare_error(source))?;
        channel
            .bind_queue(&self.error_name, &self.error_name, "#")
            .await
            .map_err(|source| self.declare_error(source))?;

        channel
            .bind_queue(&self.queue, &self.requeue_name, "#")
            .await
            .map_err(|source| self.declare_error(source))?;

        info!(
            queue = %self.queue,
            retry = %self.retry_name,
            error = %self.error_name,
            requeue = %self.requeue_name,
            retry_ttl_ms = self.retry_ttl.as_millis() as u64,
            "Retry topology established"
        );

        Ok(())
    }

    /// Returns the worker queue name this topology belongs to.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Returns the retry exchange name, shared by the retry queue.
    pub fn retry_name(&self) -> &str {
        &self.retry_name
    }

    /// Returns the error exchange name, shared by the error queue.
    pub fn error_name(&self) -> &str {
        &self.error_name
    }

    /// Returns the requeue exchange name.
    pub fn requeue_name(&self) -> &str {
        &self.requeue_name
    }

    /// Returns the attempt limit.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns how long rejected messages wait before redelivery.
    pub fn retry_ttl(&self) -> Duration {
        self.retry_ttl
    }

    fn declare_error(&self, source: BrokerError) -> TopologyError {
        TopologyError::Declare {
            queue: self.queue.clone(),
            source,
        }
    }
}
