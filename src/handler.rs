//! Disposition handlers.
//!
//! A disposition handler translates the executor's [`Outcome`] into at most
//! one broker operation for the delivery:
//!
//! - [`OneshotHandler`]: Fixed one-to-one mapping, no redelivery machinery
//! - [`MaxRetryHandler`]: Bounded retries through the dead-letter cascade,
//!   then an [`ErrorRecord`] on the error exchange
//!
//! `dispatch` takes the delivery by value. Whatever the handler decides, the
//! delivery is gone afterwards, so a second acknowledge or reject for the
//! same delivery cannot be written.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::broker::{BrokerChannel, BrokerError};
use crate::delivery::Delivery;
use crate::outcome::{JobError, Outcome};
use crate::topology::RetryTopology;

/// Errors that can occur while dispatching a disposition.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A broker operation failed.
    #[error("Broker operation failed: {0}")]
    Broker(#[from] BrokerError),

    /// Serializing the error record failed.
    #[error("Error record serialization failed: {0}")]
    Record(#[from] serde_json::Error),
}

/// The broker-visible action a handler performed for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The delivery was acknowledged.
    Acked,
    /// The delivery was rejected without requeue.
    Rejected,
    /// The delivery was rejected back onto its queue.
    Requeued,
    /// An error record was published and the original delivery acked.
    RoutedToError,
    /// No broker operation was performed.
    Noop,
}

impl Disposition {
    /// Returns the lowercase label for this disposition.
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::Rejected => "rejected",
            Disposition::Requeued => "requeued",
            Disposition::RoutedToError => "routed-to-error",
            Disposition::Noop => "noop",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Decides and performs the broker operation for one processed delivery.
///
/// Implementations match on the outcome with a default arm, so an outcome a
/// handler does not understand degrades to [`Disposition::Noop`] instead of
/// a broker operation it did not choose deliberately.
#[async_trait]
pub trait DispositionHandler: Send + Sync {
    /// Consumes the delivery and settles it according to the outcome.
    async fn dispatch(
        &self,
        outcome: Outcome,
        delivery: Delivery,
    ) -> Result<Disposition, HandlerError>;
}

/// Handler without redelivery: every failure is terminal.
pub struct OneshotHandler {
    channel: Arc<dyn BrokerChannel>,
}

impl OneshotHandler {
    /// Creates a oneshot handler on the given channel.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl DispositionHandler for OneshotHandler {
    async fn dispatch(
        &self,
        outcome: Outcome,
        delivery: Delivery,
    ) -> Result<Disposition, HandlerError> {
        match outcome {
            Outcome::Ack => {
                self.channel.ack(delivery.delivery_tag).await?;
                Ok(Disposition::Acked)
            }
            Outcome::Reject | Outcome::Timeout | Outcome::Error(_) => {
                self.channel.reject(delivery.delivery_tag, false).await?;
                Ok(Disposition::Rejected)
            }
            Outcome::Requeue => {
                self.channel.reject(delivery.delivery_tag, true).await?;
                Ok(Disposition::Requeued)
            }
            _ => Ok(Disposition::Noop),
        }
    }
}

/// Handler that retries failures a bounded number of times.
///
/// Failed deliveries are rejected so the worker queue's dead-letter argument
/// sends them through the retry cascade; the handler never publishes to the
/// retry exchange itself. The attempt count is read from the delivery's
/// `x-death` history, so it survives worker restarts. Once the count exceeds
/// the limit, the handler publishes an [`ErrorRecord`] to the error exchange
/// and acks the original.
pub struct MaxRetryHandler {
    channel: Arc<dyn BrokerChannel>,
    topology: Arc<RetryTopology>,
}

impl MaxRetryHandler {
    /// Creates a max-retry handler on the given channel and topology.
    pub fn new(channel: Arc<dyn BrokerChannel>, topology: Arc<RetryTopology>) -> Self {
        Self { channel, topology }
    }

    async fn retry_or_route(
        &self,
        failure: Option<JobError>,
        reason: &'static str,
        delivery: Delivery,
    ) -> Result<Disposition, HandlerError> {
        let num_attempts = delivery.failure_count(self.topology.queue_name()) + 1;

        if num_attempts <= u64::from(self.topology.max_retries()) {
            warn!(
                queue = %self.topology.queue_name(),
                delivery_tag = delivery.delivery_tag,
                num_attempts,
                max_retries = self.topology.max_retries(),
                reason,
                "Delivery failed, cycling through retry queue"
            );
            self.channel.reject(delivery.delivery_tag, false).await?;
            return Ok(Disposition::Rejected);
        }

        let record = ErrorRecord::new(failure.as_ref(), reason, num_attempts, &delivery.payload);
        let body = serde_json::to_vec(&record)?;
        self.channel
            .publish(self.topology.error_name(), &delivery.routing_key, &body)
            .await?;
        self.channel.ack(delivery.delivery_tag).await?;

        error!(
            queue = %self.topology.queue_name(),
            delivery_tag = delivery.delivery_tag,
            num_attempts,
            error = %record.error,
            "Retries exhausted, routed to error exchange"
        );
        Ok(Disposition::RoutedToError)
    }
}

#[async_trait]
impl DispositionHandler for MaxRetryHandler {
    async fn dispatch(
        &self,
        outcome: Outcome,
        delivery: Delivery,
    ) -> Result<Disposition, HandlerError> {
        match outcome {
            Outcome::Ack => {
                self.channel.ack(delivery.delivery_tag).await?;
                Ok(Disposition::Acked)
            }
            Outcome::Requeue => {
                self.channel.reject(delivery.delivery_tag, true).await?;
                Ok(Disposition::Requeued)
            }
            Outcome::Reject => self.retry_or_route(None, "reject", delivery).await,
            Outcome::Timeout => self.retry_or_route(None, "timeout", delivery).await,
            Outcome::Error(err) => self.retry_or_route(Some(err), "error", delivery).await,
            _ => Ok(Disposition::Noop),
        }
    }
}

/// The record published to the error exchange when retries run out.
///
/// `failed_at` serializes as an RFC 3339 timestamp; `payload` carries the
/// original message body in standard base64 so opaque binary payloads
/// survive the JSON encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Failure message, or the reason tag for reject and timeout.
    pub error: String,
    /// Error type name, when the failure carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    /// Error message, when the failure carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Up to ten cause-chain entries joined by ", ".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
    /// Attempt count at the moment retries ran out.
    pub num_attempts: u64,
    /// When the final attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Original payload, standard base64.
    pub payload: String,
}

impl ErrorRecord {
    fn new(failure: Option<&JobError>, reason: &str, num_attempts: u64, payload: &[u8]) -> Self {
        let (error, error_class, error_message, backtrace) = match failure {
            Some(err) => (
                err.message.clone(),
                Some(err.class.clone()),
                Some(err.message.clone()),
                if err.trace.is_empty() {
                    None
                } else {
                    Some(
                        err.trace
                            .iter()
                            .take(10)
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", "),
                    )
                },
            ),
            None => (reason.to_string(), None, None, None),
        };

        Self {
            error,
            error_class,
            error_message,
            backtrace,
            num_attempts,
            failed_at: Utc::now(),
            payload: BASE64.encode(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConsumeOptions, InMemoryBroker, QueueOptions};
    use crate::config::WorkerConfig;
    use crate::delivery::{Headers, X_DEATH};
    use serde_json::json;

    async fn delivered(broker: &InMemoryBroker, queue: &str) -> Delivery {
        let subscription = broker
            .consume(queue, &ConsumeOptions::default())
            .await
            .expect("consume");
        subscription.next().await.expect("delivery")
    }

    fn death_headers(queue: &str, count: u64) -> Headers {
        let mut headers = Headers::new();
        headers.insert(
            X_DEATH,
            json!([{ "queue": queue, "reason": "rejected", "count": count }]),
        );
        headers
    }

    async fn retry_setup(config: &WorkerConfig) -> (InMemoryBroker, Arc<RetryTopology>) {
        let broker = InMemoryBroker::new();
        let topology = RetryTopology::new("orders", config);
        let options = QueueOptions::default()
            .with_argument("x-dead-letter-exchange", json!(topology.retry_name()));
        broker.declare_queue("orders", &options).await.expect("declare");
        topology.establish(&broker).await.expect("establish");
        (broker, Arc::new(topology))
    }

    #[test]
    fn test_disposition_labels() {
        assert_eq!(Disposition::Acked.label(), "acked");
        assert_eq!(Disposition::Rejected.label(), "rejected");
        assert_eq!(Disposition::Requeued.label(), "requeued");
        assert_eq!(Disposition::RoutedToError.label(), "routed-to-error");
        assert_eq!(format!("{}", Disposition::Noop), "noop");
    }

    #[tokio::test]
    async fn test_oneshot_ack() {
        let broker = InMemoryBroker::new();
        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        let delivery = delivered(&broker, "orders").await;
        let handler = OneshotHandler::new(Arc::new(broker.clone()));

        let disposition = handler.dispatch(Outcome::Ack, delivery).await.expect("dispatch");

        assert_eq!(disposition, Disposition::Acked);
        assert_eq!(broker.unacked_len().await, 0);
        assert_eq!(broker.queue_len("orders").await, 0);
    }

    #[tokio::test]
    async fn test_oneshot_rejects_failures() {
        for outcome in [
            Outcome::Reject,
            Outcome::Timeout,
            Outcome::Error(JobError::msg("boom")),
        ] {
            let broker = InMemoryBroker::new();
            broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
            let delivery = delivered(&broker, "orders").await;
            let handler = OneshotHandler::new(Arc::new(broker.clone()));

            let disposition = handler.dispatch(outcome, delivery).await.expect("dispatch");

            assert_eq!(disposition, Disposition::Rejected);
            assert_eq!(broker.unacked_len().await, 0);
            // No dead-letter argument on the queue: the message is dropped.
            assert_eq!(broker.queue_len("orders").await, 0);
        }
    }

    #[tokio::test]
    async fn test_oneshot_requeue_puts_message_back() {
        let broker = InMemoryBroker::new();
        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        let delivery = delivered(&broker, "orders").await;
        let handler = OneshotHandler::new(Arc::new(broker.clone()));

        let disposition = handler
            .dispatch(Outcome::Requeue, delivery)
            .await
            .expect("dispatch");

        assert_eq!(disposition, Disposition::Requeued);
        assert_eq!(broker.queue_len("orders").await, 1);
        assert_eq!(broker.unacked_len().await, 0);
    }

    #[tokio::test]
    async fn test_oneshot_noop_leaves_delivery_unsettled() {
        let broker = InMemoryBroker::new();
        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        let delivery = delivered(&broker, "orders").await;
        let handler = OneshotHandler::new(Arc::new(broker.clone()));

        let disposition = handler.dispatch(Outcome::Noop, delivery).await.expect("dispatch");

        assert_eq!(disposition, Disposition::Noop);
        assert_eq!(broker.unacked_len().await, 1);
    }

    #[tokio::test]
    async fn test_max_retry_ack_and_requeue_bypass_retry_logic() {
        let config = WorkerConfig::default();
        let (broker, topology) = retry_setup(&config).await;
        let handler = MaxRetryHandler::new(Arc::new(broker.clone()), Arc::clone(&topology));

        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        let delivery = delivered(&broker, "orders").await;
        assert_eq!(
            handler.dispatch(Outcome::Ack, delivery).await.expect("dispatch"),
            Disposition::Acked
        );

        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        let delivery = delivered(&broker, "orders").await;
        assert_eq!(
            handler.dispatch(Outcome::Requeue, delivery).await.expect("dispatch"),
            Disposition::Requeued
        );
        assert_eq!(broker.queue_len("orders").await, 1);
        assert_eq!(broker.queue_len(topology.retry_name()).await, 0);
    }

    #[tokio::test]
    async fn test_max_retry_first_failure_enters_retry_queue() {
        let config = WorkerConfig::default();
        let (broker, topology) = retry_setup(&config).await;
        let handler = MaxRetryHandler::new(Arc::new(broker.clone()), Arc::clone(&topology));

        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        let delivery = delivered(&broker, "orders").await;

        let disposition = handler
            .dispatch(Outcome::Reject, delivery)
            .await
            .expect("dispatch");

        assert_eq!(disposition, Disposition::Rejected);
        assert_eq!(broker.queue_len(topology.retry_name()).await, 1);
        assert_eq!(broker.queue_len(topology.error_name()).await, 0);
        assert_eq!(broker.unacked_len().await, 0);
    }

    #[tokio::test]
    async fn test_max_retry_retries_up_to_the_limit() {
        let config = WorkerConfig::default().with_retry_max_times(3);
        let (broker, topology) = retry_setup(&config).await;
        let handler = MaxRetryHandler::new(Arc::new(broker.clone()), Arc::clone(&topology));

        // Third attempt: two recorded failures, still within the limit.
        broker
            .deliver(
                "orders",
                "orders.created",
                b"{}".to_vec(),
                Some(death_headers("orders", 2)),
            )
            .await;
        let delivery = delivered(&broker, "orders").await;

        let disposition = handler
            .dispatch(Outcome::Reject, delivery)
            .await
            .expect("dispatch");

        assert_eq!(disposition, Disposition::Rejected);
        assert_eq!(broker.queue_len(topology.retry_name()).await, 1);
        assert_eq!(broker.queue_len(topology.error_name()).await, 0);
    }

    #[tokio::test]
    async fn test_max_retry_routes_to_error_after_exhaustion() {
        let config = WorkerConfig::default().with_retry_max_times(3);
        let (broker, topology) = retry_setup(&config).await;
        let handler = MaxRetryHandler::new(Arc::new(broker.clone()), Arc::clone(&topology));

        let failure = JobError {
            class: "TimeoutError".to_string(),
            message: "upstream stalled".to_string(),
            trace: vec!["socket read".to_string(), "tcp connect".to_string()],
        };
        broker
            .deliver(
                "orders",
                "orders.created",
                b"order-77".to_vec(),
                Some(death_headers("orders", 3)),
            )
            .await;
        let delivery = delivered(&broker, "orders").await;

        let disposition = handler
            .dispatch(Outcome::Error(failure), delivery)
            .await
            .expect("dispatch");

        assert_eq!(disposition, Disposition::RoutedToError);
        assert_eq!(broker.queue_len(topology.retry_name()).await, 0);
        assert_eq!(broker.unacked_len().await, 0);

        let bodies = broker.peek_queue(topology.error_name()).await;
        assert_eq!(bodies.len(), 1);
        let record: ErrorRecord = serde_json::from_slice(&bodies[0]).expect("record");
        assert_eq!(record.error, "upstream stalled");
        assert_eq!(record.error_class.as_deref(), Some("TimeoutError"));
        assert_eq!(record.error_message.as_deref(), Some("upstream stalled"));
        assert_eq!(record.backtrace.as_deref(), Some("socket read, tcp connect"));
        assert_eq!(record.num_attempts, 4);
        assert_eq!(BASE64.decode(&record.payload).expect("base64"), b"order-77");
    }

    #[tokio::test]
    async fn test_max_retry_reason_tags_for_plain_failures() {
        for (outcome, tag) in [(Outcome::Reject, "reject"), (Outcome::Timeout, "timeout")] {
            let config = WorkerConfig::default().with_retry_max_times(1);
            let (broker, topology) = retry_setup(&config).await;
            let handler = MaxRetryHandler::new(Arc::new(broker.clone()), Arc::clone(&topology));

            broker
                .deliver(
                    "orders",
                    "orders.created",
                    b"{}".to_vec(),
                    Some(death_headers("orders", 1)),
                )
                .await;
            let delivery = delivered(&broker, "orders").await;

            let disposition = handler.dispatch(outcome, delivery).await.expect("dispatch");

            assert_eq!(disposition, Disposition::RoutedToError);
            let bodies = broker.peek_queue(topology.error_name()).await;
            let record: ErrorRecord = serde_json::from_slice(&bodies[0]).expect("record");
            assert_eq!(record.error, tag);
            assert!(record.error_class.is_none());
            assert!(record.backtrace.is_none());
            assert_eq!(record.num_attempts, 2);
        }
    }

    #[tokio::test]
    async fn test_max_retry_noop_leaves_delivery_unsettled() {
        let config = WorkerConfig::default();
        let (broker, topology) = retry_setup(&config).await;
        let handler = MaxRetryHandler::new(Arc::new(broker.clone()), Arc::clone(&topology));

        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        let delivery = delivered(&broker, "orders").await;

        let disposition = handler.dispatch(Outcome::Noop, delivery).await.expect("dispatch");

        assert_eq!(disposition, Disposition::Noop);
        assert_eq!(broker.unacked_len().await, 1);
    }

    #[test]
    fn test_error_record_truncates_backtrace() {
        let failure = JobError {
            class: "Deep".to_string(),
            message: "deep failure".to_string(),
            trace: (0..12).map(|i| format!("cause-{i}")).collect(),
        };

        let record = ErrorRecord::new(Some(&failure), "error", 6, b"x");

        let backtrace = record.backtrace.expect("backtrace");
        assert_eq!(backtrace.split(", ").count(), 10);
        assert!(backtrace.starts_with("cause-0"));
        assert!(backtrace.ends_with("cause-9"));
    }

    #[test]
    fn test_error_record_omits_absent_fields() {
        let record = ErrorRecord::new(None, "timeout", 6, b"x");
        let json = serde_json::to_value(&record).expect("serialize");

        assert_eq!(json["error"], "timeout");
        assert!(json.get("error_class").is_none());
        assert!(json.get("error_message").is_none());
        assert!(json.get("backtrace").is_none());
    }
}
