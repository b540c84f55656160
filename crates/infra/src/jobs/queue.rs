//! The queue capability shared by producer and worker.

use async_trait::async_trait;

use super::types::{DeadLetterEntry, Delivery, EnqueueOutcome, FailOutcome, ForecastJob};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue command error: {0}")]
    Command(String),
    #[error("job serialization error: {0}")]
    Serialization(String),
    #[error("malformed queue message {message_id}: {reason}")]
    Malformed { message_id: String, reason: String },
}

/// Durable, at-least-once FIFO of [`ForecastJob`]s.
///
/// A delivery that is neither acked nor failed within the visibility timeout is
/// handed out again. Implementations are constructed explicitly and injected;
/// there is no process-wide queue.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Queue name, for logs.
    fn name(&self) -> &str;

    /// Append a job. Idempotent on `job.forecast_id`.
    async fn enqueue(&self, job: ForecastJob) -> Result<EnqueueOutcome, QueueError>;

    /// Next visible delivery for `consumer`, if any. Never blocks for long.
    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError>;

    /// Done with this delivery; the job is removed.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// This delivery failed; retry or dead-letter per the queue's policy.
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailOutcome, QueueError>;

    /// Oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;
}
