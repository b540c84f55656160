//! In-memory forecast store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use farmflow_core::{ForecastId, GroupId};
use farmflow_forecast::{ForecastOutput, ForecastRecord, LeaseToken, NewForecast, TransitionError};

use super::{to_chrono, ForecastStore, StoreError, Transition};

#[derive(Debug, Default)]
pub struct InMemoryForecastStore {
    records: RwLock<HashMap<ForecastId, ForecastRecord>>,
}

impl InMemoryForecastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ForecastId, ForecastRecord>>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::Unavailable("forecast store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ForecastId, ForecastRecord>>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Unavailable("forecast store lock poisoned".to_string()))
    }

    /// Apply `f` to the record under the write lock.
    fn update<F>(&self, id: ForecastId, f: F) -> Result<Transition, StoreError>
    where
        F: FnOnce(&mut ForecastRecord) -> Result<(), TransitionError>,
    {
        let mut records = self.write()?;
        let Some(record) = records.get_mut(&id) else {
            return Ok(Transition::Lost { current: None });
        };

        match f(record) {
            Ok(()) => Ok(Transition::Applied),
            Err(e) => {
                debug!(forecast_id = %id, status = %record.status, reason = %e, "conditional write lost");
                Ok(Transition::Lost {
                    current: Some(record.status),
                })
            }
        }
    }
}

#[async_trait]
impl ForecastStore for InMemoryForecastStore {
    async fn create(&self, new: NewForecast) -> Result<ForecastRecord, StoreError> {
        let record = ForecastRecord::new(new, Utc::now());
        self.write()?.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: ForecastId) -> Result<Option<ForecastRecord>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list_by_group(&self, group_id: GroupId) -> Result<Vec<ForecastRecord>, StoreError> {
        let mut out: Vec<ForecastRecord> = self
            .read()?
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn transition_to_running(
        &self,
        id: ForecastId,
        lease: &LeaseToken,
        ttl: Duration,
    ) -> Result<Transition, StoreError> {
        self.update(id, |r| r.begin_run(lease.clone(), to_chrono(ttl), Utc::now()))
    }

    async fn complete(
        &self,
        id: ForecastId,
        lease: &LeaseToken,
        output: ForecastOutput,
    ) -> Result<Transition, StoreError> {
        self.update(id, |r| r.complete(lease, output, Utc::now()))
    }

    async fn fail(&self, id: ForecastId, lease: &LeaseToken, reason: &str) -> Result<Transition, StoreError> {
        self.update(id, |r| r.fail(lease, reason, Utc::now()))
    }

    async fn fail_pending(&self, id: ForecastId, reason: &str) -> Result<Transition, StoreError> {
        self.update(id, |r| r.fail_pending(reason, Utc::now()))
    }

    async fn sweep_stale_running(&self, older_than: Duration) -> Result<Vec<ForecastId>, StoreError> {
        let now = Utc::now();
        let cutoff = now - to_chrono(older_than);
        let mut records = self.write()?;

        let mut swept: Vec<ForecastId> = records
            .values_mut()
            .filter_map(|r| r.expire_if_stale(cutoff, now).then_some(r.id))
            .collect();
        swept.sort();
        Ok(swept)
    }
}
