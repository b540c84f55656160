//! Forecast producer: validate, persist `pending`, enqueue, return.
//!
//! Never waits on feature building or prediction.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};
use tracing::{error, info, warn};

use farmflow_core::{GroupId, UserId};
use farmflow_forecast::{FarmDataError, ForecastKind, ForecastRecord, NewForecast};

use crate::forecast_store::{ForecastStore, StoreError};
use crate::jobs::{EnqueueOutcome, ForecastJob, JobQueue, QueueError};

use super::access::{AccessError, ForecastAccess};

pub const DEFAULT_HORIZON_DAYS: u32 = 30;
pub const MAX_HORIZON_DAYS: u32 = 365;

/// Pause between enqueue attempts, multiplied by the attempt number.
const ENQUEUE_RETRY_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProduceError {
    #[error("{0}")]
    Validation(String),
    #[error("group not found")]
    GroupNotFound,
    #[error("forbidden")]
    Forbidden,
    #[error(transparent)]
    FarmData(#[from] FarmDataError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("forecast could not be queued: {0}")]
    Queue(#[from] QueueError),
}

impl From<AccessError> for ProduceError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::GroupNotFound | AccessError::ForecastNotFound => ProduceError::GroupNotFound,
            AccessError::Forbidden => ProduceError::Forbidden,
            AccessError::FarmData(e) => ProduceError::FarmData(e),
            AccessError::Store(e) => ProduceError::Store(e),
        }
    }
}

/// A validated forecast request body.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRequest {
    pub kind: ForecastKind,
    pub model: Option<String>,
    pub horizon_days: u32,
    pub input_overrides: Map<String, JsonValue>,
}

impl ForecastRequest {
    pub fn new(kind: ForecastKind) -> Self {
        Self {
            kind,
            model: None,
            horizon_days: DEFAULT_HORIZON_DAYS,
            input_overrides: Map::new(),
        }
    }

    pub fn with_horizon(mut self, days: u32) -> Self {
        self.horizon_days = days;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Build a request from already-typed body fields, checking what the
    /// types alone cannot: the horizon range (default 30) and a non-blank model.
    pub fn validated(
        kind: ForecastKind,
        model: Option<String>,
        horizon_days: Option<u32>,
        input_overrides: Option<Map<String, JsonValue>>,
    ) -> Result<Self, ProduceError> {
        let horizon_days = horizon_days.unwrap_or(DEFAULT_HORIZON_DAYS);
        if !(1..=MAX_HORIZON_DAYS).contains(&horizon_days) {
            return Err(invalid(format!(
                "horizonDays must be an integer between 1 and {MAX_HORIZON_DAYS}"
            )));
        }

        let model = match model {
            None => None,
            Some(m) if !m.trim().is_empty() => Some(m.trim().to_string()),
            Some(_) => return Err(invalid("model must be a non-empty string")),
        };

        Ok(Self {
            kind,
            model,
            horizon_days,
            input_overrides: input_overrides.unwrap_or_default(),
        })
    }

    /// Input captured on the record: the overrides plus the effective horizon.
    fn input_json(&self) -> JsonValue {
        let mut input = self.input_overrides.clone();
        input.insert("horizonDays".to_string(), JsonValue::from(self.horizon_days));
        JsonValue::Object(input)
    }
}

fn invalid(msg: impl Into<String>) -> ProduceError {
    ProduceError::Validation(msg.into())
}

#[derive(Clone)]
pub struct ForecastProducer {
    access: ForecastAccess,
    store: Arc<dyn ForecastStore>,
    queue: Arc<dyn JobQueue>,
    default_model: String,
    enqueue_attempts: u32,
}

impl ForecastProducer {
    pub fn new(
        access: ForecastAccess,
        store: Arc<dyn ForecastStore>,
        queue: Arc<dyn JobQueue>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            access,
            store,
            queue,
            default_model: default_model.into(),
            enqueue_attempts: 3,
        }
    }

    pub fn with_enqueue_attempts(mut self, attempts: u32) -> Self {
        self.enqueue_attempts = attempts.max(1);
        self
    }

    /// Create a `pending` record for an owned group and queue its job.
    ///
    /// If the job cannot be queued after the configured attempts, the record is
    /// marked `failed` and the queue error is returned.
    pub async fn request(
        &self,
        user: UserId,
        group_id: GroupId,
        request: ForecastRequest,
    ) -> Result<ForecastRecord, ProduceError> {
        self.access.owned_group(user, group_id).await?;

        let model = request.model.clone().unwrap_or_else(|| self.default_model.clone());
        let record = self
            .store
            .create(NewForecast {
                group_id,
                kind: request.kind,
                model_name: model.clone(),
                input_json: request.input_json(),
            })
            .await?;

        let job = ForecastJob {
            forecast_id: record.id,
            group_id,
            kind: request.kind,
            model,
            horizon_days: request.horizon_days,
            input_overrides: request.input_overrides,
        };

        match self.enqueue_with_retry(job).await {
            Ok(outcome) => {
                info!(
                    forecast_id = %record.id,
                    group_id = %group_id,
                    kind = %record.kind,
                    queue = self.queue.name(),
                    duplicate = outcome == EnqueueOutcome::Duplicate,
                    "forecast queued"
                );
                Ok(record)
            }
            Err(e) => {
                let reason = format!("job could not be queued: {e}");
                if let Err(store_err) = self.store.fail_pending(record.id, &reason).await {
                    error!(forecast_id = %record.id, error = %store_err, "failed to mark unqueued forecast as failed");
                }
                Err(ProduceError::Queue(e))
            }
        }
    }

    async fn enqueue_with_retry(&self, job: ForecastJob) -> Result<EnqueueOutcome, QueueError> {
        let mut attempt = 1;
        loop {
            match self.queue.enqueue(job.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.enqueue_attempts => {
                    warn!(forecast_id = %job.forecast_id, attempt, error = %e, "enqueue failed; retrying");
                    tokio::time::sleep(ENQUEUE_RETRY_STEP * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;

    use farmflow_forecast::{AnimalGroup, ForecastStatus};

    use crate::farm_data::InMemoryFarmData;
    use crate::forecast_store::InMemoryForecastStore;
    use crate::jobs::{DeadLetterEntry, Delivery, FailOutcome, InMemoryJobQueue, QueueSettings};

    #[test]
    fn defaults_and_overrides() {
        let req = ForecastRequest::validated(ForecastKind::EggProduction, None, None, None).unwrap();
        assert_eq!(req, ForecastRequest::new(ForecastKind::EggProduction));

        let overrides = json!({ "temperature": 21, "horizonDays": 99 }).as_object().cloned();
        let req = ForecastRequest::validated(
            ForecastKind::Growth,
            Some(" prophet-v2 ".to_string()),
            Some(14),
            overrides,
        )
        .unwrap();
        assert_eq!(req.model.as_deref(), Some("prophet-v2"));
        assert_eq!(req.input_json(), json!({ "temperature": 21, "horizonDays": 14 }));
    }

    #[test]
    fn horizon_and_model_are_checked() {
        for (model, horizon) in [(None, Some(0)), (None, Some(366)), (Some("  ".to_string()), None)] {
            assert!(matches!(
                ForecastRequest::validated(ForecastKind::Growth, model, horizon, None),
                Err(ProduceError::Validation(_))
            ));
        }
        assert!(ForecastRequest::validated(ForecastKind::Growth, None, Some(365), None).is_ok());
    }

    struct BrokenQueue {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobQueue for BrokenQueue {
        fn name(&self) -> &str {
            "broken"
        }
        async fn enqueue(&self, _job: ForecastJob) -> Result<EnqueueOutcome, QueueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::Connection("connection refused".to_string()))
        }
        async fn dequeue(&self, _consumer: &str) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }
        async fn fail(&self, _delivery: &Delivery, _reason: &str) -> Result<FailOutcome, QueueError> {
            Ok(FailOutcome::DeadLettered)
        }
        async fn dead_letters(&self, _limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
            Ok(vec![])
        }
    }

    fn fixture(queue: Arc<dyn JobQueue>) -> (ForecastProducer, Arc<InMemoryForecastStore>, UserId, GroupId) {
        let farm = InMemoryFarmData::arc();
        let store = InMemoryForecastStore::arc();
        let owner = UserId::new();
        let group_id = GroupId::new();
        farm.insert_group(AnimalGroup {
            id: group_id,
            owner_id: owner,
            name: "Layers".to_string(),
            species: "chicken".to_string(),
            quantity: 100,
            start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        });
        let access = ForecastAccess::new(farm, store.clone());
        let producer = ForecastProducer::new(access, store.clone(), queue, "default-model");
        (producer, store, owner, group_id)
    }

    #[tokio::test]
    async fn request_creates_pending_record_and_job() {
        let queue = InMemoryJobQueue::arc(QueueSettings::default());
        let (producer, store, owner, group_id) = fixture(queue.clone());

        let record = producer
            .request(owner, group_id, ForecastRequest::new(ForecastKind::EggProduction))
            .await
            .unwrap();

        assert_eq!(record.status, ForecastStatus::Pending);
        assert_eq!(record.model_name, "default-model");
        assert_eq!(record.input_json, json!({ "horizonDays": 30 }));
        assert!(store.get(record.id).await.unwrap().is_some());

        let delivery = queue.dequeue("t").await.unwrap().unwrap();
        assert_eq!(delivery.job.forecast_id, record.id);
        assert_eq!(delivery.job.horizon_days, 30);
    }

    #[tokio::test]
    async fn ownership_is_enforced_before_anything_is_written() {
        let queue = InMemoryJobQueue::arc(QueueSettings::default());
        let (producer, store, _owner, group_id) = fixture(queue.clone());
        let req = ForecastRequest::new(ForecastKind::Mortality);

        assert!(matches!(
            producer.request(UserId::new(), group_id, req.clone()).await,
            Err(ProduceError::Forbidden)
        ));
        assert!(matches!(
            producer.request(UserId::new(), GroupId::new(), req).await,
            Err(ProduceError::GroupNotFound)
        ));
        assert!(store.list_by_group(group_id).await.unwrap().is_empty());
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn unqueueable_forecast_is_marked_failed() {
        let queue = Arc::new(BrokenQueue {
            calls: AtomicU32::new(0),
        });
        let (producer, store, owner, group_id) = fixture(queue.clone());
        let producer = producer.with_enqueue_attempts(2);

        let err = producer
            .request(owner, group_id, ForecastRequest::new(ForecastKind::Growth))
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::Queue(_)));
        assert_eq!(queue.calls.load(Ordering::SeqCst), 2);

        let records = store.list_by_group(group_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ForecastStatus::Failed);
        assert!(records[0].output_json.is_none());
        assert!(records[0].error.as_deref().unwrap_or("").contains("could not be queued"));
    }
}
