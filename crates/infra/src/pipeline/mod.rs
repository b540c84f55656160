//! The forecast pipeline: producer, worker and the optional stale-lease sweeper.

pub mod access;
pub mod producer;
pub mod sweeper;
pub mod worker;

pub use access::{AccessError, ForecastAccess};
pub use producer::{ForecastProducer, ForecastRequest, ProduceError};
pub use sweeper::spawn_sweeper;
pub use worker::{ForecastWorker, JobFailure, ProcessOutcome, WorkerConfig, WorkerHandle, WorkerStats};
