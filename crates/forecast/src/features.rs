//! Feature construction: recent history → [`FeatureBundle`].

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use farmflow_core::GroupId;

use crate::history::{FarmDataError, FarmDataReader};

/// Maximum number of production and feed entries read per build.
pub const HISTORY_WINDOW: usize = 90;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFeature {
    pub date: NaiveDate,
    pub eggs: i64,
    pub weight_kg: f64,
    pub mortality: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedFeature {
    pub date: NaiveDate,
    pub feed_type: String,
    pub quantity_kg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    pub species: String,
    /// The group name stands in for breed/strain.
    pub breed: String,
    pub quantity: i64,
    pub start_date: NaiveDate,
    pub age_days: i64,
}

/// Normalised input to a [`crate::Predictor`]. Rebuilt for every job, never cached.
///
/// `history` and `feed` are in chronological order (oldest first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureBundle {
    pub history: Vec<HistoryFeature>,
    pub feed: Vec<FeedFeature>,
    pub metadata: GroupMetadata,
    pub horizon: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeatureError {
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    #[error(transparent)]
    Data(#[from] FarmDataError),
}

/// Builds feature bundles from a [`FarmDataReader`].
#[derive(Clone)]
pub struct FeatureBuilder {
    reader: Arc<dyn FarmDataReader>,
}

impl FeatureBuilder {
    pub fn new(reader: Arc<dyn FarmDataReader>) -> Self {
        Self { reader }
    }

    pub async fn build(&self, group_id: GroupId, horizon_days: u32) -> Result<FeatureBundle, FeatureError> {
        self.build_at(group_id, horizon_days, Utc::now()).await
    }

    /// Same as [`FeatureBuilder::build`] with an explicit clock (`ageDays` is relative to `now`).
    pub async fn build_at(
        &self,
        group_id: GroupId,
        horizon_days: u32,
        now: DateTime<Utc>,
    ) -> Result<FeatureBundle, FeatureError> {
        let group = self
            .reader
            .find_group(group_id)
            .await?
            .ok_or(FeatureError::GroupNotFound(group_id))?;

        let production = self.reader.recent_production(group_id, HISTORY_WINDOW).await?;
        let feed = self.reader.recent_feed(group_id, HISTORY_WINDOW).await?;

        // Readers return newest first; the bundle is chronological.
        let mut history: Vec<HistoryFeature> = production
            .into_iter()
            .take(HISTORY_WINDOW)
            .map(|p| HistoryFeature {
                date: p.recorded_at.date_naive(),
                eggs: p.eggs.unwrap_or(0),
                weight_kg: p.weight_kg.unwrap_or(0.0),
                mortality: p.mortality.unwrap_or(0),
            })
            .collect();
        history.reverse();

        let mut feed: Vec<FeedFeature> = feed
            .into_iter()
            .take(HISTORY_WINDOW)
            .map(|f| FeedFeature {
                date: f.recorded_at.date_naive(),
                feed_type: f.feed_type,
                quantity_kg: f.quantity_kg,
            })
            .collect();
        feed.reverse();

        let age_days = (now.date_naive() - group.start_date).num_days().max(0);

        debug!(
            group_id = %group_id,
            history = history.len(),
            feed = feed.len(),
            age_days,
            "built forecast features"
        );

        Ok(FeatureBundle {
            history,
            feed,
            metadata: GroupMetadata {
                species: group.species,
                breed: group.name,
                quantity: group.quantity,
                start_date: group.start_date,
                age_days,
            },
            horizon: horizon_days,
        })
    }
}

impl core::fmt::Debug for FeatureBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FeatureBuilder").finish_non_exhaustive()
    }
}
