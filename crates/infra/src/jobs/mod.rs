//! Forecast job queue with retry, backoff and dead-letter handling.
//!
//! ## Components
//!
//! - [`ForecastJob`]: the queue payload, a pointer to a forecast record
//! - [`JobQueue`]: the injected queue capability
//! - [`InMemoryJobQueue`]: single-process implementation for tests/dev
//! - `RedisJobQueue` (feature `redis`): Redis Streams consumer-group implementation

pub mod in_memory;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod types;

pub use in_memory::InMemoryJobQueue;
pub use queue::{JobQueue, QueueError};
#[cfg(feature = "redis")]
pub use redis_streams::RedisJobQueue;
pub use types::{
    BackoffStrategy, DeadLetterEntry, Delivery, EnqueueOutcome, FailOutcome, ForecastJob, QueueSettings,
    RetryPolicy,
};
