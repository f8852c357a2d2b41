//! Job execution with a bounded time budget.
//!
//! The executor runs user job logic and normalizes everything that can
//! happen to it into exactly one [`Outcome`]: the returned disposition, a
//! captured error, a captured panic, or a timeout. It never retries;
//! redelivery is the disposition handler's business.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::delivery::Delivery;
use crate::outcome::{JobError, Outcome};

/// Result of one job invocation.
pub type WorkResult = Result<Outcome, JobError>;

/// User-supplied job logic.
///
/// Most jobs implement only [`work`](Self::work) and decide from the
/// payload alone. Jobs that need the routing key or headers override
/// [`work_with_delivery`](Self::work_with_delivery); its default forwards
/// to `work`.
#[async_trait]
pub trait Work: Send + Sync {
    /// Processes one payload and returns the delivery's disposition.
    async fn work(&self, payload: &[u8]) -> WorkResult;

    /// Processes one payload with access to the full delivery.
    async fn work_with_delivery(&self, payload: &[u8], _delivery: &Delivery) -> WorkResult {
        self.work(payload).await
    }
}

/// Runs job logic under a deadline.
pub struct JobExecutor {
    work: Arc<dyn Work>,
    job_timeout: Duration,
}

impl JobExecutor {
    /// Creates an executor for the given job logic and time budget.
    pub fn new(work: Arc<dyn Work>, job_timeout: Duration) -> Self {
        Self { work, job_timeout }
    }

    /// Executes the job for one delivery and returns its outcome.
    ///
    /// The job runs on its own task, so work that blocks without yielding
    /// cannot stall the consumer loop past the deadline. On timeout the
    /// task is aborted best-effort; the abort only lands at the next await
    /// point, and a completion that races past it is discarded unobserved.
    pub async fn execute(&self, delivery: &Delivery) -> Outcome {
        let work = Arc::clone(&self.work);
        let owned = delivery.clone();
        let mut job = tokio::spawn(async move {
            work.work_with_delivery(&owned.payload, &owned).await
        });

        match tokio::time::timeout(self.job_timeout, &mut job).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => Outcome::Error(err),
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    let message = panic_message(join_error.into_panic());
                    warn!(
                        delivery_tag = delivery.delivery_tag,
                        panic = %message,
                        "Job panicked"
                    );
                    Outcome::Error(JobError::panic(message))
                } else {
                    Outcome::Error(JobError::msg("job task was cancelled"))
                }
            }
            Err(_) => {
                job.abort();
                debug!(
                    delivery_tag = delivery.delivery_tag,
                    timeout_ms = self.job_timeout.as_millis() as u64,
                    "Job exceeded its time budget"
                );
                Outcome::Timeout
            }
        }
    }

    /// Returns the configured time budget.
    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}
