//! Outcome types for job execution.
//!
//! This module defines the core outcome types produced by the job executor
//! and consumed by disposition handlers:
//!
//! - `Outcome`: The disposition a processed delivery should receive
//! - `JobError`: A captured job failure (type, message, cause chain)

/// The disposition a processed delivery should receive.
///
/// Exactly one outcome is produced per delivery by the executor, and exactly
/// one is consumed per delivery by a disposition handler. Handlers match
/// exhaustively with a default arm, so adding a variant degrades to a no-op
/// for handlers that do not understand it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job succeeded; acknowledge the delivery.
    Ack,
    /// The job declined the delivery; reject without requeueing.
    Reject,
    /// The job wants the delivery redelivered as-is; reject with requeue.
    Requeue,
    /// The job exceeded its time budget.
    Timeout,
    /// The job failed with a captured error.
    Error(JobError),
    /// The job opted out; no broker operation is performed.
    Noop,
}

impl Outcome {
    /// Returns the lowercase label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ack => "ack",
            Outcome::Reject => "reject",
            Outcome::Requeue => "requeue",
            Outcome::Timeout => "timeout",
            Outcome::Error(_) => "error",
            Outcome::Noop => "noop",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A job failure captured for reporting.
///
/// Carries the error type name, the display message, and the cause chain
/// (outermost cause first). Job logic usually produces one through `?`: any
/// `std::error::Error` converts via the blanket `From` impl. `JobError`
/// deliberately does not implement `std::error::Error` itself, which is what
/// makes the blanket conversion coherent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    /// Type name of the originating error (or `"panic"` for panics).
    pub class: String,
    /// Display message of the error.
    pub message: String,
    /// Messages of the cause chain, outermost cause first.
    pub trace: Vec<String>,
}

impl JobError {
    /// Creates an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            class: "JobError".to_string(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Creates an error representing a caught panic.
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            class: "panic".to_string(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Captures an `anyhow::Error`, preserving its context chain.
    ///
    /// This is a named constructor rather than a `From` impl: coherence
    /// rules forbid a dedicated impl next to the blanket one for types that
    /// could gain a `std::error::Error` impl upstream.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            class: "anyhow::Error".to_string(),
            message: err.to_string(),
            trace: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }

        Self {
            class: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            trace,
        }
    }
}
