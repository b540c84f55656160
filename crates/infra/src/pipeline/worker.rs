//! Forecast worker: dequeue, claim, build features, predict, record the result.
//!
//! Per delivery the record moves `pending → running → {completed | failed}`.
//! The worker never retries on its own; a failed delivery is handed back to the
//! queue, which owns redelivery, backoff and dead-lettering.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use farmflow_forecast::{FeatureBuilder, FeatureError, ForecastOutput, ForecastStatus, PredictError, Predictor};

use crate::forecast_store::{ForecastStore, StoreError, Transition};
use crate::jobs::{Delivery, FailOutcome, JobQueue, QueueError};

use super::sweeper::spawn_sweeper;

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobFailure {
    #[error("feature building failed: {0}")]
    Features(#[from] FeatureError),
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed,
    /// The run failed; the record is `failed` unless `recorded` is false.
    Failed { reason: String, recorded: bool },
    /// The record is terminal or gone; the delivery was acked.
    Abandoned,
    /// Another delivery holds a live lease; left unacked for redelivery.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging; consumers are named `{name}-{n}`.
    pub name: String,
    /// Deliveries processed concurrently by this process.
    pub concurrency: usize,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    /// Record lease length; should match the queue's visibility timeout.
    pub lease_ttl: Duration,
    /// Fail `running` records whose lease lapsed this long ago; `None` disables the sweep.
    pub sweep_stale_after: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "forecast-worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            lease_ttl: Duration::from_secs(60),
            sweep_stale_after: None,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_stale_sweep(mut self, stale_after: Duration, interval: Duration) -> Self {
        self.sweep_stale_after = Some(stale_after);
        self.sweep_interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_abandoned: u64,
    pub jobs_deferred: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerHandle {
    /// Stop polling and wait for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct ForecastWorker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ForecastStore>,
    features: FeatureBuilder,
    predictor: Arc<dyn Predictor>,
    lease_ttl: Duration,
}

impl ForecastWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ForecastStore>,
        features: FeatureBuilder,
        predictor: Arc<dyn Predictor>,
    ) -> Self {
        Self {
            queue,
            store,
            features,
            predictor,
            lease_ttl: WorkerConfig::default().lease_ttl,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Spawn `config.concurrency` polling tasks on the current tokio runtime.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle {
        let worker = Arc::new(self.with_lease_ttl(config.lease_ttl));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        info!(
            worker = %config.name,
            queue = worker.queue.name(),
            concurrency = config.concurrency,
            "forecast worker started"
        );

        let mut tasks: Vec<JoinHandle<()>> = (1..=config.concurrency.max(1))
            .map(|n| {
                let consumer = format!("{}-{n}", config.name);
                let span = info_span!("worker", worker.name = %consumer);
                tokio::spawn(
                    poll_loop(
                        worker.clone(),
                        consumer,
                        config.poll_interval,
                        shutdown_rx.clone(),
                        stats.clone(),
                    )
                    .instrument(span),
                )
            })
            .collect();

        if let Some(stale_after) = config.sweep_stale_after {
            tasks.push(spawn_sweeper(
                worker.store.clone(),
                stale_after,
                config.sweep_interval,
                shutdown_rx.clone(),
            ));
        }

        WorkerHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
            started: Instant::now(),
        }
    }

    /// Take and process one delivery, if any is visible.
    pub async fn run_once(&self, consumer: &str) -> Result<Option<ProcessOutcome>, QueueError> {
        match self.queue.dequeue(consumer).await? {
            Some(delivery) => Ok(Some(self.process(delivery).await)),
            None => Ok(None),
        }
    }

    /// Run one delivery through the state machine.
    pub async fn process(&self, delivery: Delivery) -> ProcessOutcome {
        let job = &delivery.job;
        let lease = delivery.lease_token();
        let span = info_span!(
            "forecast_job",
            forecast_id = %job.forecast_id,
            message_id = %delivery.message_id,
            attempt = delivery.attempt
        );

        async {
            match self
                .store
                .transition_to_running(job.forecast_id, &lease, self.lease_ttl)
                .await
            {
                Ok(Transition::Applied) => {}
                Ok(Transition::Lost {
                    current: Some(ForecastStatus::Running),
                }) => {
                    // Another delivery holds a live lease. Leave this one unacked:
                    // the visibility timeout matches the lease, so the queue
                    // redelivers it once the lease can be taken over.
                    info!("forecast leased by another delivery; deferring");
                    return ProcessOutcome::Deferred;
                }
                Ok(Transition::Lost { current }) => {
                    info!(current = ?current, "forecast not claimable; abandoning delivery");
                    self.ack(&delivery).await;
                    return ProcessOutcome::Abandoned;
                }
                Err(e) => {
                    // Nothing was written; let the queue redeliver.
                    let reason = JobFailure::Store(e).to_string();
                    self.hand_back(&delivery, &reason).await;
                    return ProcessOutcome::Failed {
                        reason,
                        recorded: false,
                    };
                }
            }

            let started = Instant::now();
            let result = match self.run(&delivery).await {
                Ok(output) => self
                    .store
                    .complete(job.forecast_id, &lease, output)
                    .await
                    .map_err(JobFailure::from),
                Err(failure) => Err(failure),
            };

            match result {
                Ok(Transition::Applied) => {
                    info!(elapsed_ms = started.elapsed().as_millis() as u64, "forecast completed");
                    self.ack(&delivery).await;
                    ProcessOutcome::Completed
                }
                Ok(Transition::Lost { current }) => {
                    warn!(current = ?current, "lease lost before completion; result discarded");
                    self.ack(&delivery).await;
                    ProcessOutcome::Abandoned
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    warn!(error = %reason, "forecast failed");
                    let recorded = match self.store.fail(job.forecast_id, &lease, &reason).await {
                        Ok(t) => t.applied(),
                        Err(e) => {
                            error!(error = %e, "failed to record forecast failure");
                            false
                        }
                    };
                    self.hand_back(&delivery, &reason).await;
                    ProcessOutcome::Failed { reason, recorded }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, delivery: &Delivery) -> Result<ForecastOutput, JobFailure> {
        let job = &delivery.job;
        let features = self.features.build(job.group_id, job.horizon_days).await?;

        let before = Utc::now().date_naive();
        let output = self.predictor.predict(job.kind, &features, &job.model).await?;
        let after = Utc::now().date_naive();

        // The first predicted day is "tomorrow" as of either end of the call.
        let mut validated = Err(PredictError::ContractViolation("calendar overflow".to_string()));
        for first in [before.succ_opt(), after.succ_opt()].into_iter().flatten() {
            validated = output.validate(job.kind, job.horizon_days, first);
            if validated.is_ok() {
                break;
            }
        }
        validated?;

        debug!(
            score = output.score(),
            predictions = output.predictions().len(),
            "prediction validated"
        );
        Ok(output)
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            error!(error = %e, "failed to ack delivery");
        }
    }

    async fn hand_back(&self, delivery: &Delivery, reason: &str) {
        match self.queue.fail(delivery, reason).await {
            Ok(FailOutcome::Retrying { after }) => {
                debug!(retry_in_ms = after.as_millis() as u64, "delivery will be retried")
            }
            Ok(FailOutcome::DeadLettered) => warn!("delivery dead-lettered"),
            Ok(FailOutcome::Superseded) => debug!("delivery already superseded"),
            Err(e) => error!(error = %e, "failed to report delivery failure"),
        }
    }
}

async fn poll_loop(
    worker: Arc<ForecastWorker>,
    consumer: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match worker.queue.dequeue(&consumer).await {
            Ok(Some(delivery)) => {
                bump(&stats, |s| s.current_running += 1);
                let outcome = worker.process(delivery).await;
                bump(&stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match outcome {
                        ProcessOutcome::Completed => s.jobs_succeeded += 1,
                        ProcessOutcome::Failed { .. } => s.jobs_failed += 1,
                        ProcessOutcome::Abandoned => s.jobs_abandoned += 1,
                        ProcessOutcome::Deferred => s.jobs_deferred += 1,
                    }
                });
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to dequeue"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                // Handle dropped without a shutdown request: keep polling.
                if changed.is_err() {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    info!("forecast worker stopped");
}

fn bump(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}
