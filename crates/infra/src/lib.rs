//! Infrastructure layer: storage, queueing, configuration and the forecast pipeline.
//!
//! - [`forecast_store`]: durable forecast records with lease-guarded transitions
//! - [`jobs`]: the at-least-once job queue (in-memory, Redis Streams)
//! - [`farm_data`]: read access to groups and their production/feed history
//! - [`pipeline`]: the producer that accepts requests and the worker that runs them

pub mod config;
pub mod farm_data;
pub mod forecast_store;
pub mod jobs;
pub mod pipeline;

mod integration_tests;

pub use config::{AppConfig, ConfigError, PipelineConfig, RedisConfig};
pub use farm_data::{InMemoryFarmData, PostgresFarmData};
pub use forecast_store::{ForecastStore, InMemoryForecastStore, PostgresForecastStore, StoreError, Transition};
