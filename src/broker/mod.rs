//! Broker access for workers.
//!
//! This module defines the narrow channel abstraction the worker core is
//! written against, plus a complete in-memory implementation:
//!
//! - **BrokerChannel**: Declare, bind, publish, ack, reject, consume
//! - **Subscription**: Shared pull handle consumer tasks take deliveries from
//! - **InMemoryBroker**: In-process broker with topic routing, dead-lettering,
//!   and per-queue TTL expiry, used in tests and local development
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────────┐   declare/bind     ┌───────────────┐
//!    │    Worker    ├───────────────────▶│ BrokerChannel │
//!    │              │   ack/reject       │   (adapter)   │
//!    └──────┬───────┘                    └───────┬───────┘
//!           │ next()                             │
//!    ┌──────▼───────┐                    ┌───────▼───────┐
//!    │ Subscription │◀───deliveries──────│    Broker     │
//!    └──────────────┘                    └───────────────┘
//! ```
//!
//! Adapters for real brokers implement [`BrokerChannel`] over their client
//! library; the worker never sees connection URLs or transport framing.

pub mod channel;
pub mod memory;

// Re-export main types for convenience
pub use channel::{
    BrokerChannel, BrokerError, ConsumeOptions, ExchangeKind, ExchangeOptions, QueueOptions,
    Subscription,
};
pub use memory::InMemoryBroker;
