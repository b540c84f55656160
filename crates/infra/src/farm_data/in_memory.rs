//! In-memory farm history for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use farmflow_core::GroupId;
use farmflow_forecast::{AnimalGroup, FarmDataError, FarmDataReader, FeedRecord, ProductionRecord};

#[derive(Debug, Default)]
struct Data {
    groups: HashMap<GroupId, AnimalGroup>,
    production: HashMap<GroupId, Vec<ProductionRecord>>,
    feed: HashMap<GroupId, Vec<FeedRecord>>,
}

/// Seedable in-memory [`FarmDataReader`].
#[derive(Debug, Default)]
pub struct InMemoryFarmData {
    data: RwLock<Data>,
}

impl InMemoryFarmData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert_group(&self, group: AnimalGroup) {
        if let Ok(mut data) = self.data.write() {
            data.groups.insert(group.id, group);
        }
    }

    pub fn add_production(&self, group_id: GroupId, record: ProductionRecord) {
        if let Ok(mut data) = self.data.write() {
            data.production.entry(group_id).or_default().push(record);
        }
    }

    pub fn add_feed(&self, group_id: GroupId, record: FeedRecord) {
        if let Ok(mut data) = self.data.write() {
            data.feed.entry(group_id).or_default().push(record);
        }
    }

    /// One egg-count entry per day for the `days` days before `until`.
    pub fn seed_daily_eggs(&self, group_id: GroupId, days: u32, eggs: i64, until: DateTime<Utc>) {
        for d in 1..=i64::from(days) {
            self.add_production(
                group_id,
                ProductionRecord {
                    recorded_at: until - Duration::days(d),
                    eggs: Some(eggs),
                    weight_kg: None,
                    mortality: Some(0),
                },
            );
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Data>, FarmDataError> {
        self.data
            .read()
            .map_err(|_| FarmDataError::Unavailable("farm data lock poisoned".to_string()))
    }
}

#[async_trait]
impl FarmDataReader for InMemoryFarmData {
    async fn find_group(&self, group_id: GroupId) -> Result<Option<AnimalGroup>, FarmDataError> {
        Ok(self.read()?.groups.get(&group_id).cloned())
    }

    async fn recent_production(
        &self,
        group_id: GroupId,
        limit: usize,
    ) -> Result<Vec<ProductionRecord>, FarmDataError> {
        let mut rows = self.read()?.production.get(&group_id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn recent_feed(&self, group_id: GroupId, limit: usize) -> Result<Vec<FeedRecord>, FarmDataError> {
        let mut rows = self.read()?.feed.get(&group_id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        rows.truncate(limit);
        Ok(rows)
    }
}
