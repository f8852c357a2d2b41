//! Queue worker: a pool of consumer tasks over one subscription.
//!
//! A worker owns one queue. Construction declares the queue (and, for the
//! max-retry handler, the whole retry topology); `start` registers a single
//! consumer and spawns the configured number of tasks, which pull competing
//! deliveries from the shared subscription. Each task runs the cycle
//! `next -> execute -> dispatch` and owns a lazily created handler instance
//! for its lifetime.
//!
//! # Features
//!
//! - Configurable consumer-task count
//! - Oneshot or bounded-retry disposition handling, or a custom factory
//! - Graceful shutdown with a drain timeout
//! - Delivery statistics tracking

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::broker::{BrokerChannel, BrokerError, ConsumeOptions, QueueOptions, Subscription};
use crate::config::{ConfigError, HandlerKind, WorkerConfig};
use crate::executor::{JobExecutor, Work};
use crate::handler::{Disposition, DispositionHandler, MaxRetryHandler, OneshotHandler};
use crate::topology::{RetryTopology, TopologyError};

const STATE_IDLE: u8 = 0;
const STATE_SUBSCRIBED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Errors that can occur in the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Configuration rejected by validation.
    #[error("Configuration invalid: {0}")]
    Config(#[from] ConfigError),

    /// Establishing the retry topology failed.
    #[error("Topology declaration failed: {0}")]
    Topology(#[from] TopologyError),

    /// A broker operation failed.
    #[error("Broker operation failed: {0}")]
    Broker(#[from] BrokerError),

    /// Worker is already subscribed.
    #[error("Worker is already subscribed")]
    AlreadyRunning,

    /// Worker has not been started.
    #[error("Worker is not running")]
    NotRunning,

    /// Worker was cancelled and cannot be restarted.
    #[error("Worker has been cancelled")]
    Cancelled,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed but not yet consuming.
    Idle,
    /// Consuming deliveries.
    Subscribed,
    /// Stopped, by `stop` or by the broker; not restartable.
    Cancelled,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_SUBSCRIBED => WorkerState::Subscribed,
            STATE_CANCELLED => WorkerState::Cancelled,
            _ => WorkerState::Idle,
        }
    }

    /// Returns the lowercase label for this state.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Subscribed => "subscribed",
            WorkerState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Statistics about a worker's deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Deliveries that went through the full execute-dispatch cycle.
    pub processed: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries rejected (terminally or into the retry cycle).
    pub rejected: u64,
    /// Deliveries rejected back onto their queue.
    pub requeued: u64,
    /// Deliveries whose error record was published.
    pub routed_to_error: u64,
    /// Deliveries left unsettled by a noop outcome.
    pub noop: u64,
    /// Dispatches that failed with a broker or serialization error.
    pub dispatch_failures: u64,
    /// Deliveries currently being processed.
    pub active: u64,
}

impl WorkerStats {
    /// Returns the number of deliveries settled with a broker operation.
    pub fn settled(&self) -> u64 {
        self.acked + self.rejected + self.requeued + self.routed_to_error
    }
}

/// Shared state for tracking worker statistics.
struct SharedWorkerStats {
    processed: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    routed_to_error: AtomicU64,
    noop: AtomicU64,
    dispatch_failures: AtomicU64,
    active: AtomicU64,
}

impl SharedWorkerStats {
    fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            routed_to_error: AtomicU64::new(0),
            noop: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            active: AtomicU64::new(0),
        }
    }

    fn record_disposition(&self, disposition: Disposition) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        let counter = match disposition {
            Disposition::Acked => &self.acked,
            Disposition::Rejected => &self.rejected,
            Disposition::Requeued => &self.requeued,
            Disposition::RoutedToError => &self.routed_to_error,
            Disposition::Noop => &self.noop,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn record_dispatch_failure(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.dispatch_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            requeued: self.requeued.load(Ordering::SeqCst),
            routed_to_error: self.routed_to_error.load(Ordering::SeqCst),
            noop: self.noop.load(Ordering::SeqCst),
            dispatch_failures: self.dispatch_failures.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
        }
    }
}

/// Factory producing one handler instance per consumer task.
///
/// Invoked lazily on a task's first delivery; the instance then lives for
/// the task's lifetime and is never shared across tasks.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn DispositionHandler> + Send + Sync>;

/// Worker consuming one queue with a pool of consumer tasks.
pub struct Worker {
    /// Short random identifier for this worker.
    id: String,
    /// Name of the consumed queue.
    queue_name: String,
    /// Channel to the broker; injected, never closed by the worker.
    channel: Arc<dyn BrokerChannel>,
    /// Deadline-enforcing executor around the job logic.
    executor: Arc<JobExecutor>,
    config: WorkerConfig,
    /// Retry topology, present for the max-retry handler.
    topology: Option<Arc<RetryTopology>>,
    handler_factory: HandlerFactory,
    subscription: Option<Arc<dyn Subscription>>,
    task_handles: Vec<JoinHandle<()>>,
    state: Arc<AtomicU8>,
    stats: Arc<SharedWorkerStats>,
}

impl Worker {
    /// Creates a worker for a queue, declaring everything it consumes from.
    ///
    /// The queue is declared with the configured durability flags and
    /// arguments. With [`HandlerKind::MaxRetry`] the retry topology is
    /// established as well, and `x-dead-letter-exchange` is merged into the
    /// queue arguments unless the caller already set one.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError` if validation, a declaration, or topology
    /// establishment fails.
    pub async fn new(
        channel: Arc<dyn BrokerChannel>,
        queue_name: impl Into<String>,
        work: Arc<dyn Work>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let queue_name = queue_name.into();
        let id = generate_worker_id();

        let topology = match config.handler {
            HandlerKind::Oneshot => None,
            HandlerKind::MaxRetry => Some(Arc::new(RetryTopology::new(&queue_name, &config))),
        };

        let mut queue_options = QueueOptions {
            durable: config.durable,
            auto_delete: config.auto_delete,
            arguments: config.queue_arguments.clone(),
        };
        if let Some(topology) = &topology {
            queue_options
                .arguments
                .entry("x-dead-letter-exchange")
                .or_insert_with(|| Value::String(topology.retry_name().to_string()));
        }
        channel.declare_queue(&queue_name, &queue_options).await?;

        if let Some(topology) = &topology {
            topology.establish(channel.as_ref()).await?;
        }

        let handler_factory: HandlerFactory = match &topology {
            None => {
                let channel = Arc::clone(&channel);
                Arc::new(move || {
                    Box::new(OneshotHandler::new(Arc::clone(&channel)))
                        as Box<dyn DispositionHandler>
                })
            }
            Some(topology) => {
                let channel = Arc::clone(&channel);
                let topology = Arc::clone(topology);
                Arc::new(move || {
                    Box::new(MaxRetryHandler::new(
                        Arc::clone(&channel),
                        Arc::clone(&topology),
                    )) as Box<dyn DispositionHandler>
                })
            }
        };

        let executor = Arc::new(JobExecutor::new(work, config.job_timeout));

        info!(
            worker_id = %id,
            queue = %queue_name,
            handler = %config.handler,
            "Worker created"
        );

        Ok(Self {
            id,
            queue_name,
            channel,
            executor,
            config,
            topology,
            handler_factory,
            subscription: None,
            task_handles: Vec::new(),
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            stats: Arc::new(SharedWorkerStats::new()),
        })
    }

    /// Replaces the built-in disposition handler with a custom factory.
    pub fn with_handler_factory(mut self, factory: HandlerFactory) -> Self {
        self.handler_factory = factory;
        self
    }

    /// Starts consuming: registers the subscription and spawns the tasks.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::AlreadyRunning` if already subscribed,
    /// `WorkerError::Cancelled` if the worker was stopped, or a broker error
    /// if the consume registration fails.
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        match self.state() {
            WorkerState::Subscribed => return Err(WorkerError::AlreadyRunning),
            WorkerState::Cancelled => return Err(WorkerError::Cancelled),
            WorkerState::Idle => {}
        }

        let consumer_tag = self
            .config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.queue_name, Uuid::new_v4()));
        let options = ConsumeOptions {
            consumer_tag,
            exclusive: self.config.exclusive,
        };
        let subscription = self.channel.consume(&self.queue_name, &options).await?;
        self.subscription = Some(Arc::clone(&subscription));
        self.state.store(STATE_SUBSCRIBED, Ordering::SeqCst);

        let remaining = Arc::new(AtomicUsize::new(self.config.threads));
        for _ in 0..self.config.threads {
            let task = ConsumerTask {
                worker_id: self.id.clone(),
                queue_name: self.queue_name.clone(),
                subscription: Arc::clone(&subscription),
                executor: Arc::clone(&self.executor),
                factory: Arc::clone(&self.handler_factory),
                stats: Arc::clone(&self.stats),
                state: Arc::clone(&self.state),
                remaining: Arc::clone(&remaining),
            };
            self.task_handles.push(tokio::spawn(task.run()));
        }

        info!(
            worker_id = %self.id,
            queue = %self.queue_name,
            threads = self.config.threads,
            "Worker subscribed"
        );

        Ok(())
    }

    /// Stops consuming and drains the consumer tasks.
    ///
    /// In-flight deliveries finish their cycle; no new delivery is accepted.
    /// The injected channel stays open, it belongs to the caller.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::NotRunning` if the worker was never started, or
    /// `WorkerError::ShutdownTimeout` if the tasks do not finish in time.
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        if self.state() == WorkerState::Idle {
            return Err(WorkerError::NotRunning);
        }

        info!(worker_id = %self.id, queue = %self.queue_name, "Stopping worker");
        self.state.store(STATE_CANCELLED, Ordering::SeqCst);

        if let Some(subscription) = self.subscription.take() {
            subscription.cancel().await?;
        }

        let worker_id = self.id.clone();
        let drain = async {
            for handle in self.task_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(worker_id = %worker_id, error = %e, "Consumer task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => {
                info!(worker_id = %self.id, queue = %self.queue_name, "Worker stopped");
                Ok(())
            }
            Err(_) => Err(WorkerError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns the worker's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the consumed queue's name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns the retry topology, when the max-retry handler is configured.
    pub fn topology(&self) -> Option<&RetryTopology> {
        self.topology.as_deref()
    }

    /// Returns a snapshot of the delivery statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }
}

/// One consumer task: pulls deliveries, executes, dispatches.
struct ConsumerTask {
    worker_id: String,
    queue_name: String,
    subscription: Arc<dyn Subscription>,
    executor: Arc<JobExecutor>,
    factory: HandlerFactory,
    stats: Arc<SharedWorkerStats>,
    state: Arc<AtomicU8>,
    remaining: Arc<AtomicUsize>,
}

impl ConsumerTask {
    /// Main task loop. Runs until the subscription is cancelled.
    async fn run(self) {
        debug!(worker_id = %self.worker_id, queue = %self.queue_name, "Consumer task started");

        // Created on the first delivery, reused for the task's lifetime.
        let mut handler: Option<Box<dyn DispositionHandler>> = None;

        while let Some(delivery) = self.subscription.next().await {
            self.stats.increment_active();
            let delivery_tag = delivery.delivery_tag;

            let outcome = self.executor.execute(&delivery).await;
            let outcome_label = outcome.label();

            let handler = handler.get_or_insert_with(|| (self.factory)());
            match handler.dispatch(outcome, delivery).await {
                Ok(disposition) => {
                    self.stats.record_disposition(disposition);
                    debug!(
                        worker_id = %self.worker_id,
                        queue = %self.queue_name,
                        delivery_tag,
                        outcome = outcome_label,
                        disposition = %disposition,
                        "Delivery settled"
                    );
                }
                Err(e) => {
                    self.stats.record_dispatch_failure();
                    error!(
                        worker_id = %self.worker_id,
                        queue = %self.queue_name,
                        delivery_tag,
                        outcome = outcome_label,
                        error = %e,
                        "Disposition dispatch failed"
                    );
                }
            }

            self.stats.decrement_active();
        }

        // The broker can cancel the consumer from its side; the last task
        // out marks the worker terminal.
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.store(STATE_CANCELLED, Ordering::SeqCst);
            debug!(worker_id = %self.worker_id, queue = %self.queue_name, "Last consumer task exited");
        }
    }
}

/// Generates the short random base-36 worker id.
fn generate_worker_id() -> String {
    use rand::RngExt;

    let mut value: u64 = rand::rng().random();
    let mut id = String::new();
    loop {
        id.insert(0, BASE36_DIGITS[(value % 36) as usize] as char);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::executor::WorkResult;
    use crate::handler::HandlerError;
    use crate::outcome::Outcome;
    use async_trait::async_trait;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    struct Always(Outcome);

    #[async_trait]
    impl Work for Always {
        async fn work(&self, _payload: &[u8]) -> WorkResult {
            Ok(self.0.clone())
        }
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            if Instant::now() > deadline {
                panic!("condition not met within {:?}", WAIT);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_worker_id_uses_base36_alphabet() {
        for _ in 0..20 {
            let id = generate_worker_id();
            assert!(!id.is_empty());
            assert!(id.bytes().all(|b| BASE36_DIGITS.contains(&b)));
        }
    }

    #[test]
    fn test_worker_state_labels() {
        assert_eq!(WorkerState::Idle.label(), "idle");
        assert_eq!(WorkerState::Subscribed.label(), "subscribed");
        assert_eq!(format!("{}", WorkerState::Cancelled), "cancelled");
    }

    #[test]
    fn test_shared_worker_stats() {
        let stats = SharedWorkerStats::new();

        stats.record_disposition(Disposition::Acked);
        stats.record_disposition(Disposition::Acked);
        stats.record_disposition(Disposition::Rejected);
        stats.record_disposition(Disposition::RoutedToError);
        stats.record_dispatch_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed, 5);
        assert_eq!(snapshot.acked, 2);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.routed_to_error, 1);
        assert_eq!(snapshot.dispatch_failures, 1);
        assert_eq!(snapshot.settled(), 4);
    }

    #[test]
    fn test_worker_error_display() {
        let err = WorkerError::AlreadyRunning;
        assert!(err.to_string().contains("already subscribed"));

        let err = WorkerError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }

    #[tokio::test]
    async fn test_worker_processes_and_acks() {
        let broker = InMemoryBroker::new();
        let mut worker = Worker::new(
            Arc::new(broker.clone()),
            "orders",
            Arc::new(Always(Outcome::Ack)),
            WorkerConfig::default().with_threads(2),
        )
        .await
        .expect("worker");

        for i in 0..3 {
            broker
                .deliver("orders", "orders.created", format!("order-{i}"), None)
                .await;
        }
        worker.start().await.expect("start");

        wait_until(|| worker.stats().acked == 3).await;
        assert_eq!(worker.stats().processed, 3);
        assert_eq!(broker.queue_len("orders").await, 0);
        assert_eq!(broker.unacked_len().await, 0);
        assert_eq!(worker.state(), WorkerState::Subscribed);

        worker.stop().await.expect("stop");
        assert_eq!(worker.state(), WorkerState::Cancelled);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = InMemoryBroker::new();
        let mut worker = Worker::new(
            Arc::new(broker),
            "orders",
            Arc::new(Always(Outcome::Ack)),
            WorkerConfig::default(),
        )
        .await
        .expect("worker");

        worker.start().await.expect("start");
        assert!(matches!(
            worker.start().await,
            Err(WorkerError::AlreadyRunning)
        ));

        worker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_stop_before_start_fails() {
        let broker = InMemoryBroker::new();
        let mut worker = Worker::new(
            Arc::new(broker),
            "orders",
            Arc::new(Always(Outcome::Ack)),
            WorkerConfig::default(),
        )
        .await
        .expect("worker");

        assert!(matches!(worker.stop().await, Err(WorkerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_after_stop_fails() {
        let broker = InMemoryBroker::new();
        let mut worker = Worker::new(
            Arc::new(broker),
            "orders",
            Arc::new(Always(Outcome::Ack)),
            WorkerConfig::default(),
        )
        .await
        .expect("worker");

        worker.start().await.expect("start");
        worker.stop().await.expect("stop");
        assert!(matches!(worker.start().await, Err(WorkerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stop_accepts_no_new_deliveries() {
        let broker = InMemoryBroker::new();
        let mut worker = Worker::new(
            Arc::new(broker.clone()),
            "orders",
            Arc::new(Always(Outcome::Ack)),
            WorkerConfig::default(),
        )
        .await
        .expect("worker");

        worker.start().await.expect("start");
        worker.stop().await.expect("stop");

        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(broker.queue_len("orders").await, 1);
        assert_eq!(worker.stats().processed, 0);
    }

    #[tokio::test]
    async fn test_max_retry_worker_wires_dead_lettering() {
        let broker = InMemoryBroker::new();
        let mut worker = Worker::new(
            Arc::new(broker.clone()),
            "orders",
            Arc::new(Always(Outcome::Reject)),
            WorkerConfig::default().with_handler(HandlerKind::MaxRetry),
        )
        .await
        .expect("worker");
        let retry_name = worker.topology().expect("topology").retry_name().to_string();

        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        worker.start().await.expect("start");

        wait_until(|| worker.stats().rejected == 1).await;
        let deadline = Instant::now() + WAIT;
        while broker.queue_len(&retry_name).await != 1 {
            assert!(Instant::now() < deadline, "message never reached retry queue");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        worker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_broker_side_cancel_moves_worker_to_cancelled() {
        let broker = InMemoryBroker::new();
        let mut worker = Worker::new(
            Arc::new(broker.clone()),
            "orders",
            Arc::new(Always(Outcome::Ack)),
            WorkerConfig::default().with_threads(2),
        )
        .await
        .expect("worker");

        worker.start().await.expect("start");
        broker.cancel_consumers("orders").await;

        wait_until(|| worker.state() == WorkerState::Cancelled).await;

        // stop after a broker-side cancel just drains the finished tasks.
        worker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_custom_handler_factory() {
        struct CountingHandler {
            channel: Arc<dyn BrokerChannel>,
            dispatched: Arc<AtomicU64>,
        }

        #[async_trait]
        impl DispositionHandler for CountingHandler {
            async fn dispatch(
                &self,
                _outcome: Outcome,
                delivery: crate::delivery::Delivery,
            ) -> Result<Disposition, HandlerError> {
                self.dispatched.fetch_add(1, Ordering::SeqCst);
                self.channel.ack(delivery.delivery_tag).await?;
                Ok(Disposition::Acked)
            }
        }

        let broker = InMemoryBroker::new();
        let dispatched = Arc::new(AtomicU64::new(0));
        let channel: Arc<dyn BrokerChannel> = Arc::new(broker.clone());

        let factory_channel = Arc::clone(&channel);
        let factory_count = Arc::clone(&dispatched);
        let factory: HandlerFactory = Arc::new(move || {
            Box::new(CountingHandler {
                channel: Arc::clone(&factory_channel),
                dispatched: Arc::clone(&factory_count),
            }) as Box<dyn DispositionHandler>
        });

        let mut worker = Worker::new(
            Arc::clone(&channel),
            "orders",
            Arc::new(Always(Outcome::Noop)),
            WorkerConfig::default(),
        )
        .await
        .expect("worker")
        .with_handler_factory(factory);

        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        worker.start().await.expect("start");

        wait_until(|| dispatched.load(Ordering::SeqCst) == 1).await;
        assert_eq!(worker.stats().acked, 1);

        worker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_each_consumer_task_builds_its_own_handler() {
        use tokio::sync::Barrier;

        struct Rendezvous {
            barrier: Arc<Barrier>,
        }

        #[async_trait]
        impl Work for Rendezvous {
            async fn work(&self, _payload: &[u8]) -> WorkResult {
                self.barrier.wait().await;
                Ok(Outcome::Ack)
            }
        }

        let broker = InMemoryBroker::new();
        let built = Arc::new(AtomicU64::new(0));
        let channel: Arc<dyn BrokerChannel> = Arc::new(broker.clone());

        let factory_channel = Arc::clone(&channel);
        let factory_built = Arc::clone(&built);
        let factory: HandlerFactory = Arc::new(move || {
            factory_built.fetch_add(1, Ordering::SeqCst);
            Box::new(OneshotHandler::new(Arc::clone(&factory_channel)))
                as Box<dyn DispositionHandler>
        });

        let mut worker = Worker::new(
            Arc::clone(&channel),
            "orders",
            Arc::new(Rendezvous {
                barrier: Arc::new(Barrier::new(2)),
            }),
            WorkerConfig::default().with_threads(2),
        )
        .await
        .expect("worker")
        .with_handler_factory(factory);

        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        broker.deliver("orders", "orders.created", b"{}".to_vec(), None).await;
        worker.start().await.expect("start");

        // The barrier releases only once each task holds one delivery, so
        // both tasks must build a handler of their own.
        wait_until(|| worker.stats().acked == 2).await;
        assert_eq!(built.load(Ordering::SeqCst), 2);

        worker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_oneshot_worker_has_no_topology() {
        let broker = InMemoryBroker::new();
        let worker = Worker::new(
            Arc::new(broker),
            "orders",
            Arc::new(Always(Outcome::Ack)),
            WorkerConfig::default(),
        )
        .await
        .expect("worker");

        assert!(worker.topology().is_none());
        assert_eq!(worker.queue_name(), "orders");
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(!worker.id().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let broker = InMemoryBroker::new();
        let result = Worker::new(
            Arc::new(broker),
            "orders",
            Arc::new(Always(Outcome::Ack)),
            WorkerConfig::default().with_threads(0),
        )
        .await;

        assert!(matches!(result, Err(WorkerError::Config(_))));
    }
}
