//! Worker configuration.
//!
//! This module provides the configuration surface for a worker: queue
//! declaration flags, consumer options, the execution time budget, and the
//! retry topology knobs (limit, delay, exchange name overrides).

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Which built-in disposition handler a worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerKind {
    /// Settle every delivery in one step: ack, reject, or requeue.
    #[default]
    Oneshot,
    /// Bounded retries through the dead-letter topology, then the error queue.
    MaxRetry,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerKind::Oneshot => write!(f, "oneshot"),
            HandlerKind::MaxRetry => write!(f, "max-retry"),
        }
    }
}

impl std::str::FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "oneshot" => Ok(HandlerKind::Oneshot),
            "max-retry" | "max_retry" => Ok(HandlerKind::MaxRetry),
            other => Err(format!("unknown handler kind '{}'", other)),
        }
    }
}

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Queue declaration
    /// Whether declared queues and exchanges survive a broker restart.
    pub durable: bool,
    /// Whether the worker queue is removed once unused.
    pub auto_delete: bool,
    /// Extra arguments for the worker queue declaration.
    pub queue_arguments: Map<String, Value>,

    // Consumption
    /// Number of concurrent consumer tasks.
    pub threads: usize,
    /// Consumer tag to register with; `None` generates one.
    pub consumer_tag: Option<String>,
    /// Whether the worker demands sole access to its queue.
    pub exclusive: bool,

    // Execution
    /// Time budget for a single job execution.
    pub job_timeout: Duration,
    /// How long `stop` waits for in-flight jobs before giving up.
    pub shutdown_timeout: Duration,

    // Disposition
    /// Which built-in handler settles deliveries.
    pub handler: HandlerKind,
    /// Maximum number of attempts before a message is routed to the error
    /// queue (first attempt included).
    pub retry_max_times: u32,
    /// How long a rejected message waits in the retry queue before being
    /// requeued.
    pub retry_timeout: Duration,
    /// Override for the retry exchange name; `None` derives `<queue>-retry`.
    pub retry_exchange: Option<String>,
    /// Override for the error exchange name; `None` derives `<queue>-error`.
    pub retry_error_exchange: Option<String>,
    /// Override for the requeue exchange name; `None` derives
    /// `<queue>-retry-requeue`.
    pub retry_requeue_exchange: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            queue_arguments: Map::new(),
            threads: 1,
            consumer_tag: None,
            exclusive: false,
            job_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            handler: HandlerKind::Oneshot,
            retry_max_times: 5,
            retry_timeout: Duration::from_millis(60_000),
            retry_exchange: None,
            retry_error_exchange: None,
            retry_requeue_exchange: None,
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DOCKHAND_DURABLE`: Durable declarations (default: true)
    /// - `DOCKHAND_AUTO_DELETE`: Auto-delete worker queue (default: false)
    /// - `DOCKHAND_THREADS`: Concurrent consumer tasks (default: 1)
    /// - `DOCKHAND_CONSUMER_TAG`: Consumer tag (default: generated)
    /// - `DOCKHAND_EXCLUSIVE`: Exclusive consumer (default: false)
    /// - `DOCKHAND_JOB_TIMEOUT_SECS`: Job time budget in seconds (default: 30)
    /// - `DOCKHAND_SHUTDOWN_TIMEOUT_SECS`: Stop deadline in seconds (default: 30)
    /// - `DOCKHAND_HANDLER`: `oneshot` or `max-retry` (default: oneshot)
    /// - `DOCKHAND_RETRY_MAX_TIMES`: Attempt limit (default: 5)
    /// - `DOCKHAND_RETRY_TIMEOUT_MS`: Retry delay in milliseconds (default: 60000)
    /// - `DOCKHAND_RETRY_EXCHANGE`: Retry exchange name override
    /// - `DOCKHAND_RETRY_ERROR_EXCHANGE`: Error exchange name override
    /// - `DOCKHAND_RETRY_REQUEUE_EXCHANGE`: Requeue exchange name override
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DOCKHAND_DURABLE") {
            config.durable = parse_env_bool(&val, "DOCKHAND_DURABLE")?;
        }

        if let Ok(val) = std::env::var("DOCKHAND_AUTO_DELETE") {
            config.auto_delete = parse_env_bool(&val, "DOCKHAND_AUTO_DELETE")?;
        }

        if let Ok(val) = std::env::var("DOCKHAND_THREADS") {
            config.threads = parse_env_value(&val, "DOCKHAND_THREADS")?;
        }

        if let Ok(val) = std::env::var("DOCKHAND_CONSUMER_TAG") {
            config.consumer_tag = Some(val);
        }

        if let Ok(val) = std::env::var("DOCKHAND_EXCLUSIVE") {
            config.exclusive = parse_env_bool(&val, "DOCKHAND_EXCLUSIVE")?;
        }

        if let Ok(val) = std::env::var("DOCKHAND_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCKHAND_JOB_TIMEOUT_SECS")?;
            config.job_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DOCKHAND_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DOCKHAND_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DOCKHAND_HANDLER") {
            config.handler = parse_env_value(&val, "DOCKHAND_HANDLER")?;
        }

        if let Ok(val) = std::env::var("DOCKHAND_RETRY_MAX_TIMES") {
            config.retry_max_times = parse_env_value(&val, "DOCKHAND_RETRY_MAX_TIMES")?;
        }

        if let Ok(val) = std::env::var("DOCKHAND_RETRY_TIMEOUT_MS") {
            let millis: u64 = parse_env_value(&val, "DOCKHAND_RETRY_TIMEOUT_MS")?;
            config.retry_timeout = Duration::from_millis(millis);
        }

        if let Ok(val) = std::env::var("DOCKHAND_RETRY_EXCHANGE") {
            config.retry_exchange = Some(val);
        }

        if let Ok(val) = std::env::var("DOCKHAND_RETRY_ERROR_EXCHANGE") {
            config.retry_error_exchange = Some(val);
        }

        if let Ok(val) = std::env::var("DOCKHAND_RETRY_REQUEUE_EXCHANGE") {
            config.retry_requeue_exchange = Some(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::ValidationFailed(
                "threads must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "shutdown_timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry_max_times == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_max_times must be at least 1".to_string(),
            ));
        }

        if self.retry_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "retry_timeout must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("retry_exchange", &self.retry_exchange),
            ("retry_error_exchange", &self.retry_error_exchange),
            ("retry_requeue_exchange", &self.retry_requeue_exchange),
        ] {
            if let Some(exchange) = value {
                if exchange.is_empty() {
                    return Err(ConfigError::ValidationFailed(format!(
                        "{} cannot be empty",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Builder method to set queue durability.
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Builder method to set queue auto-deletion.
    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Builder method to add a worker queue argument.
    pub fn with_queue_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.queue_arguments.insert(name.into(), value);
        self
    }

    /// Builder method to set the number of consumer tasks.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Builder method to set the consumer tag.
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    /// Builder method to demand exclusive queue access.
    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Builder method to set the job time budget.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder method to set the stop deadline.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder method to select the disposition handler.
    pub fn with_handler(mut self, handler: HandlerKind) -> Self {
        self.handler = handler;
        self
    }

    /// Builder method to set the attempt limit.
    pub fn with_retry_max_times(mut self, max_times: u32) -> Self {
        self.retry_max_times = max_times;
        self
    }

    /// Builder method to set the retry delay.
    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    /// Builder method to override the retry exchange name.
    pub fn with_retry_exchange(mut self, name: impl Into<String>) -> Self {
        self.retry_exchange = Some(name.into());
        self
    }

    /// Builder method to override the error exchange name.
    pub fn with_retry_error_exchange(mut self, name: impl Into<String>) -> Self {
        self.retry_error_exchange = Some(name.into());
        self
    }

    /// Builder method to override the requeue exchange name.
    pub fn with_retry_requeue_exchange(mut self, name: impl Into<String>) -> Self {
        self.retry_requeue_exchange = Some(name.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
