//! Integration tests for the forecast pipeline.
//!
//! Producer → ForecastStore → JobQueue → Worker → FeatureBuilder → Predictor → ForecastStore
//!
//! Verifies:
//! - A 90-day constant flock produces a complete, plausible 30-day forecast
//! - Status only moves forward, and output exists only on `completed`
//! - Predictor failures end in `failed` with no output
//! - Duplicate deliveries of the same job never both write
//! - A failure the store could not record is retried after the lease lapses

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};

    use farmflow_core::{ForecastId, GroupId, UserId};
    use farmflow_forecast::{
        AnimalGroup, DecayPredictor, FeatureBuilder, FeatureBundle, ForecastKind, ForecastOutput, ForecastRecord,
        ForecastStatus, LeaseToken, NewForecast, PredictError, Predictor,
    };
    use serde_json::Map;

    use crate::farm_data::InMemoryFarmData;
    use crate::forecast_store::{ForecastStore, InMemoryForecastStore, StoreError, Transition};
    use crate::jobs::{Delivery, ForecastJob, InMemoryJobQueue, JobQueue, QueueSettings, RetryPolicy};
    use crate::pipeline::{
        ForecastAccess, ForecastProducer, ForecastRequest, ForecastWorker, ProcessOutcome, WorkerConfig,
    };

    struct FailingPredictor;

    #[async_trait]
    impl Predictor for FailingPredictor {
        async fn predict(
            &self,
            _kind: ForecastKind,
            _features: &FeatureBundle,
            _model_name: &str,
        ) -> Result<ForecastOutput, PredictError> {
            Err(PredictError::Failed("model server returned 500".to_string()))
        }
    }

    /// Delegates to an in-memory store, but the first `fail` errors out.
    #[derive(Default)]
    struct BlipOnFirstFail {
        inner: InMemoryForecastStore,
        blipped: AtomicBool,
    }

    #[async_trait]
    impl ForecastStore for BlipOnFirstFail {
        async fn create(&self, new: NewForecast) -> Result<ForecastRecord, StoreError> {
            self.inner.create(new).await
        }

        async fn get(&self, id: ForecastId) -> Result<Option<ForecastRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn list_by_group(&self, group_id: GroupId) -> Result<Vec<ForecastRecord>, StoreError> {
            self.inner.list_by_group(group_id).await
        }

        async fn transition_to_running(
            &self,
            id: ForecastId,
            lease: &LeaseToken,
            ttl: Duration,
        ) -> Result<Transition, StoreError> {
            self.inner.transition_to_running(id, lease, ttl).await
        }

        async fn complete(
            &self,
            id: ForecastId,
            lease: &LeaseToken,
            output: ForecastOutput,
        ) -> Result<Transition, StoreError> {
            self.inner.complete(id, lease, output).await
        }

        async fn fail(&self, id: ForecastId, lease: &LeaseToken, reason: &str) -> Result<Transition, StoreError> {
            if !self.blipped.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.fail(id, lease, reason).await
        }

        async fn fail_pending(&self, id: ForecastId, reason: &str) -> Result<Transition, StoreError> {
            self.inner.fail_pending(id, reason).await
        }

        async fn sweep_stale_running(&self, older_than: Duration) -> Result<Vec<ForecastId>, StoreError> {
            self.inner.sweep_stale_running(older_than).await
        }
    }

    struct Pipeline {
        farm: Arc<InMemoryFarmData>,
        store: Arc<InMemoryForecastStore>,
        queue: Arc<InMemoryJobQueue>,
        producer: ForecastProducer,
        owner: UserId,
        group_id: GroupId,
    }

    impl Pipeline {
        fn new(max_deliveries: u32) -> Self {
            let farm = InMemoryFarmData::arc();
            let store = InMemoryForecastStore::arc();
            let queue = InMemoryJobQueue::arc(
                QueueSettings::default().with_retry(RetryPolicy::fixed(max_deliveries, Duration::ZERO)),
            );

            let owner = UserId::new();
            let group_id = GroupId::new();
            farm.insert_group(AnimalGroup {
                id: group_id,
                owner_id: owner,
                name: "Layer house 1".to_string(),
                species: "chicken".to_string(),
                quantity: 60,
                start_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            });
            farm.seed_daily_eggs(group_id, 90, 50, Utc::now());

            let access = ForecastAccess::new(farm.clone(), store.clone());
            let producer = ForecastProducer::new(access, store.clone(), queue.clone(), "default-model");

            Self {
                farm,
                store,
                queue,
                producer,
                owner,
                group_id,
            }
        }

        fn worker(&self, predictor: Arc<dyn Predictor>) -> ForecastWorker {
            ForecastWorker::new(
                self.queue.clone(),
                self.store.clone(),
                FeatureBuilder::new(self.farm.clone()),
                predictor,
            )
        }

        fn fast_worker(&self) -> ForecastWorker {
            self.worker(Arc::new(DecayPredictor::new().with_latency(Duration::ZERO)))
        }

        async fn request(&self, horizon: u32) -> ForecastRecord {
            self.producer
                .request(
                    self.owner,
                    self.group_id,
                    ForecastRequest::new(ForecastKind::EggProduction).with_horizon(horizon),
                )
                .await
                .unwrap()
        }

        async fn record(&self, record: &ForecastRecord) -> ForecastRecord {
            self.store.get(record.id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn constant_flock_gets_a_complete_thirty_day_forecast() {
        let p = Pipeline::new(3);
        let record = p.request(30).await;
        assert_eq!(record.status, ForecastStatus::Pending);

        let outcome = p.fast_worker().run_once("w").await.unwrap();
        assert_eq!(outcome, Some(ProcessOutcome::Completed));

        let done = p.record(&record).await;
        assert_eq!(done.status, ForecastStatus::Completed);
        assert!(done.result_invariant_holds());

        let output = done.output_json.as_ref().unwrap();
        let predictions = output.predictions();
        assert_eq!(predictions.len(), 30);

        // Tolerate a midnight rollover between the run and this check.
        let today = Utc::now().date_naive();
        let tomorrow = today.succ_opt().unwrap();
        assert!(predictions[0].date == tomorrow || predictions[0].date == today);
        assert!(predictions.windows(2).all(|w| w[1].date == w[0].date.succ_opt().unwrap()));

        let avg = output.series().summary.avg_next_7_days;
        assert!((0.0..=60.0).contains(&avg), "avg {avg}");
        assert!((45.0..=55.0).contains(&avg), "avg {avg} should track the 50/day history");
        assert_eq!(done.score, Some(output.score()));

        assert_eq!(p.queue.in_flight(), 0);
        assert_eq!(p.queue.waiting(), 0);
    }

    #[tokio::test]
    async fn predictor_failure_is_recorded_without_output() {
        let p = Pipeline::new(1);
        let record = p.request(7).await;

        let outcome = p.worker(Arc::new(FailingPredictor)).run_once("w").await.unwrap();
        assert!(matches!(outcome, Some(ProcessOutcome::Failed { recorded: true, .. })));

        let failed = p.record(&record).await;
        assert_eq!(failed.status, ForecastStatus::Failed);
        assert!(failed.output_json.is_none());
        assert!(failed.score.is_none());
        assert!(failed.error.as_deref().unwrap_or("").contains("model server returned 500"));

        let dead = p.queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.forecast_id, record.id);
    }

    #[tokio::test]
    async fn redelivery_of_a_failed_forecast_is_abandoned() {
        let p = Pipeline::new(3);
        let record = p.request(7).await;

        let failing = p.worker(Arc::new(FailingPredictor));
        assert!(matches!(
            failing.run_once("w").await.unwrap(),
            Some(ProcessOutcome::Failed { .. })
        ));

        // The queue retries, but the record is terminal.
        let outcome = p.fast_worker().run_once("w").await.unwrap();
        assert_eq!(outcome, Some(ProcessOutcome::Abandoned));
        assert_eq!(p.record(&record).await.status, ForecastStatus::Failed);
        assert!(p.record(&record).await.output_json.is_none());
        assert_eq!(p.queue.waiting() + p.queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn missing_group_fails_the_forecast() {
        let p = Pipeline::new(1);
        let orphan = p
            .store
            .create(NewForecast {
                group_id: GroupId::new(),
                kind: ForecastKind::Growth,
                model_name: "default-model".to_string(),
                input_json: serde_json::json!({ "horizonDays": 5 }),
            })
            .await
            .unwrap();
        p.queue
            .enqueue(ForecastJob {
                forecast_id: orphan.id,
                group_id: orphan.group_id,
                kind: ForecastKind::Growth,
                model: "default-model".to_string(),
                horizon_days: 5,
                input_overrides: Map::new(),
            })
            .await
            .unwrap();

        let outcome = p.fast_worker().run_once("w").await.unwrap();
        match outcome {
            Some(ProcessOutcome::Failed { reason, recorded }) => {
                assert!(recorded);
                assert!(reason.contains("group not found"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(p.record(&orphan).await.status, ForecastStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_delivery_cannot_steal_a_live_lease() {
        let p = Pipeline::new(3);
        let record = p.request(10).await;
        let worker = p.fast_worker();

        let first = p.queue.dequeue("a").await.unwrap().unwrap();
        // A second copy of the same message, as after a visibility timeout.
        let duplicate = Delivery {
            attempt: first.attempt + 1,
            ..first.clone()
        };

        p.store
            .transition_to_running(record.id, &first.lease_token(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(worker.process(duplicate).await, ProcessOutcome::Deferred);
        assert_eq!(p.record(&record).await.status, ForecastStatus::Running);

        assert_eq!(worker.process(first).await, ProcessOutcome::Completed);
        let done = p.record(&record).await;
        assert_eq!(done.status, ForecastStatus::Completed);
        assert_eq!(done.output_json.unwrap().predictions().len(), 10);
    }

    #[tokio::test]
    async fn unrecorded_failure_is_retried_once_the_lease_lapses() {
        let p = Pipeline::new(3);
        let lease = Duration::from_millis(200);
        let store = Arc::new(BlipOnFirstFail::default());
        let queue = InMemoryJobQueue::arc(
            QueueSettings::default()
                .with_visibility_timeout(lease)
                .with_retry(RetryPolicy::fixed(3, Duration::ZERO)),
        );
        let worker = ForecastWorker::new(
            queue.clone(),
            store.clone(),
            FeatureBuilder::new(p.farm.clone()),
            Arc::new(FailingPredictor),
        )
        .with_lease_ttl(lease);

        let record = store
            .create(NewForecast {
                group_id: p.group_id,
                kind: ForecastKind::EggProduction,
                model_name: "default-model".to_string(),
                input_json: serde_json::json!({ "horizonDays": 7 }),
            })
            .await
            .unwrap();
        queue
            .enqueue(ForecastJob {
                forecast_id: record.id,
                group_id: p.group_id,
                kind: ForecastKind::EggProduction,
                model: "default-model".to_string(),
                horizon_days: 7,
                input_overrides: Map::new(),
            })
            .await
            .unwrap();

        // The failure could not be written; the record still holds the first lease.
        let first = worker.run_once("w").await.unwrap();
        assert!(matches!(first, Some(ProcessOutcome::Failed { recorded: false, .. })));
        assert_eq!(store.get(record.id).await.unwrap().unwrap().status, ForecastStatus::Running);

        // The retry arrives while that lease is live and must stay queued.
        assert_eq!(worker.run_once("w").await.unwrap(), Some(ProcessOutcome::Deferred));
        assert_eq!(queue.in_flight(), 1);

        tokio::time::sleep(lease * 3).await;
        let third = worker.run_once("w").await.unwrap();
        assert!(matches!(third, Some(ProcessOutcome::Failed { recorded: true, .. })), "{third:?}");

        let failed = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(failed.status, ForecastStatus::Failed);
        assert!(failed.output_json.is_none());
        assert_eq!(queue.waiting() + queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn observed_statuses_only_move_forward() {
        let p = Pipeline::new(3);
        let record = p.request(30).await;

        let handle = p
            .worker(Arc::new(DecayPredictor::new().with_latency(Duration::from_millis(150))))
            .spawn(
                WorkerConfig::default()
                    .with_concurrency(1)
                    .with_poll_interval(Duration::from_millis(5)),
            );

        let mut seen = vec![ForecastStatus::Pending];
        for _ in 0..400 {
            let current = p.record(&record).await;
            assert!(current.result_invariant_holds());
            if seen.last() != Some(&current.status) {
                seen.push(current.status);
            }
            if current.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        let allowed = [
            ForecastStatus::Pending,
            ForecastStatus::Running,
            ForecastStatus::Completed,
        ];
        let mut it = allowed.iter();
        assert!(seen.iter().all(|s| it.any(|a| a == s)), "{seen:?}");
        assert_eq!(seen.last(), Some(&ForecastStatus::Completed));
    }

    #[tokio::test]
    async fn spawned_worker_drains_the_queue_and_reports_stats() {
        let p = Pipeline::new(3);
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(p.request(3).await);
        }

        let handle = p.fast_worker().spawn(
            WorkerConfig::default()
                .with_name("test-worker")
                .with_concurrency(2)
                .with_poll_interval(Duration::from_millis(5)),
        );

        for _ in 0..400 {
            let stats = handle.stats();
            if stats.jobs_processed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.jobs_processed, 5);
        assert_eq!(stats.jobs_succeeded, 5);
        assert_eq!(stats.current_running, 0);
        for r in &ids {
            assert_eq!(p.record(r).await.status, ForecastStatus::Completed);
        }
    }
}
