//! dockhand: Message-queue workers with bounded dead-letter retries.
//!
//! This library provides workers that consume queues through a pluggable
//! broker channel, execute job logic under a deadline, and settle every
//! delivery exactly once, directly or through a dead-letter retry cascade.

// Core modules
pub mod broker;
pub mod config;
pub mod delivery;
pub mod executor;
pub mod handler;
pub mod outcome;
pub mod topology;
pub mod worker;

// Re-export the commonly used types
pub use broker::{
    BrokerChannel, BrokerError, ConsumeOptions, ExchangeKind, ExchangeOptions, InMemoryBroker,
    QueueOptions, Subscription,
};
pub use config::{ConfigError, HandlerKind, WorkerConfig};
pub use delivery::{Delivery, Headers};
pub use executor::{JobExecutor, Work, WorkResult};
pub use handler::{
    Disposition, DispositionHandler, ErrorRecord, HandlerError, MaxRetryHandler, OneshotHandler,
};
pub use outcome::{JobError, Outcome};
pub use topology::{RetryTopology, TopologyError};
pub use worker::{HandlerFactory, Worker, WorkerError, WorkerState, WorkerStats};
