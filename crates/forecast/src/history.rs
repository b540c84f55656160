//! Farm history as read by the feature builder.
//!
//! The storage behind [`FarmDataReader`] is owned by the wider application;
//! only the fields forecasting needs are modelled here.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use farmflow_core::{GroupId, UserId};

/// An animal group (flock, herd, cohort).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimalGroup {
    pub id: GroupId,
    pub owner_id: UserId,
    pub name: String,
    /// Species slug, e.g. `"chicken"`.
    pub species: String,
    /// Current head count.
    pub quantity: i64,
    pub start_date: NaiveDate,
}

/// One production log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRecord {
    pub recorded_at: DateTime<Utc>,
    pub eggs: Option<i64>,
    pub weight_kg: Option<f64>,
    pub mortality: Option<i64>,
}

/// One feed log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub recorded_at: DateTime<Utc>,
    pub feed_type: String,
    pub quantity_kg: f64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FarmDataError {
    #[error("farm data unavailable: {0}")]
    Unavailable(String),
}

/// Read access to groups and their history.
///
/// `recent_*` return at most `limit` entries, newest first.
#[async_trait]
pub trait FarmDataReader: Send + Sync + 'static {
    async fn find_group(&self, group_id: GroupId) -> Result<Option<AnimalGroup>, FarmDataError>;

    async fn recent_production(
        &self,
        group_id: GroupId,
        limit: usize,
    ) -> Result<Vec<ProductionRecord>, FarmDataError>;

    async fn recent_feed(&self, group_id: GroupId, limit: usize) -> Result<Vec<FeedRecord>, FarmDataError>;
}
