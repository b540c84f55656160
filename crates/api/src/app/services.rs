//! Service wiring: picks in-memory or persistent adapters and assembles the
//! producer, read access and worker around them.

use std::sync::Arc;

use anyhow::Context;

use farmflow_forecast::{DecayPredictor, FarmDataReader, FeatureBuilder, Predictor};
use farmflow_infra::config::{AppConfig, PipelineConfig};
use farmflow_infra::farm_data::{InMemoryFarmData, PostgresFarmData};
use farmflow_infra::forecast_store::{ForecastStore, InMemoryForecastStore, PostgresForecastStore};
use farmflow_infra::jobs::{InMemoryJobQueue, JobQueue, RedisJobQueue};
use farmflow_infra::pipeline::{ForecastAccess, ForecastProducer, ForecastWorker, WorkerConfig, WorkerHandle};

#[derive(Clone)]
pub struct AppServices {
    pub producer: ForecastProducer,
    pub access: ForecastAccess,
    pub store: Arc<dyn ForecastStore>,
    pub queue: Arc<dyn JobQueue>,
    pub farm: Arc<dyn FarmDataReader>,
    pub pipeline: PipelineConfig,
}

impl AppServices {
    pub fn from_parts(
        store: Arc<dyn ForecastStore>,
        queue: Arc<dyn JobQueue>,
        farm: Arc<dyn FarmDataReader>,
        pipeline: PipelineConfig,
    ) -> Self {
        let access = ForecastAccess::new(farm.clone(), store.clone());
        let producer = ForecastProducer::new(access.clone(), store.clone(), queue.clone(), &pipeline.default_model)
            .with_enqueue_attempts(pipeline.enqueue_attempts);

        Self {
            producer,
            access,
            store,
            queue,
            farm,
            pipeline,
        }
    }

    /// In-memory store and queue over the given farm data (dev/test).
    pub fn in_memory(pipeline: PipelineConfig, farm: Arc<InMemoryFarmData>) -> Self {
        let store = InMemoryForecastStore::arc();
        let queue = InMemoryJobQueue::arc(pipeline.queue_settings());
        Self::from_parts(store, queue, farm, pipeline)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::default()
            .with_concurrency(self.pipeline.worker_concurrency)
            .with_poll_interval(self.pipeline.poll_interval)
            .with_lease_ttl(self.pipeline.visibility_timeout);
        if let Some(stale_after) = self.pipeline.sweep_stale_after {
            config = config.with_stale_sweep(stale_after, stale_after.min(std::time::Duration::from_secs(60)));
        }
        config
    }

    pub fn worker(&self, predictor: Arc<dyn Predictor>) -> ForecastWorker {
        ForecastWorker::new(
            self.queue.clone(),
            self.store.clone(),
            FeatureBuilder::new(self.farm.clone()),
            predictor,
        )
    }

    /// Start a worker with the shipped predictor.
    pub fn spawn_worker(&self) -> WorkerHandle {
        let predictor = DecayPredictor::new().with_latency(self.pipeline.predictor_latency);
        self.worker(Arc::new(predictor)).spawn(self.worker_config())
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    if !config.use_persistent_stores {
        tracing::info!("using in-memory forecast store, queue and farm data");
        return Ok(AppServices::in_memory(config.pipeline.clone(), InMemoryFarmData::arc()));
    }

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required when USE_PERSISTENT_STORES=true")?;
    let pool = sqlx::PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresForecastStore::new(pool.clone());
    store.ensure_schema().await.context("failed to prepare forecasts table")?;
    let farm = PostgresFarmData::new(pool);
    if config.bootstrap_farm_schema {
        farm.ensure_schema().await.context("failed to prepare farm history tables")?;
    }

    Ok(AppServices::from_parts(
        Arc::new(store),
        build_queue(config)?,
        Arc::new(farm),
        config.pipeline.clone(),
    ))
}

/// The Redis queue shared by the API and standalone workers.
fn build_queue(config: &AppConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    let queue = RedisJobQueue::new(config.redis.url(), config.pipeline.queue_settings())
        .context("invalid Redis configuration")?;
    tracing::info!(queue = %config.pipeline.queue_name, "using Redis Streams job queue");
    Ok(Arc::new(queue))
}
