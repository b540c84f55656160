//! Ownership-checked reads of groups and forecast records.

use std::sync::Arc;

use farmflow_core::{ForecastId, GroupId, UserId};
use farmflow_forecast::{AnimalGroup, FarmDataError, FarmDataReader, ForecastRecord};

use crate::forecast_store::{ForecastStore, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
    #[error("group not found")]
    GroupNotFound,
    #[error("forecast not found")]
    ForecastNotFound,
    #[error("forbidden")]
    Forbidden,
    #[error(transparent)]
    FarmData(#[from] FarmDataError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A user may see a group (and its forecasts) only if they own it.
#[derive(Clone)]
pub struct ForecastAccess {
    farm: Arc<dyn FarmDataReader>,
    store: Arc<dyn ForecastStore>,
}

impl ForecastAccess {
    pub fn new(farm: Arc<dyn FarmDataReader>, store: Arc<dyn ForecastStore>) -> Self {
        Self { farm, store }
    }

    pub async fn owned_group(&self, user: UserId, group_id: GroupId) -> Result<AnimalGroup, AccessError> {
        let group = self
            .farm
            .find_group(group_id)
            .await?
            .ok_or(AccessError::GroupNotFound)?;
        if group.owner_id != user {
            return Err(AccessError::Forbidden);
        }
        Ok(group)
    }

    /// Forecasts for an owned group, newest first.
    pub async fn list(&self, user: UserId, group_id: GroupId) -> Result<Vec<ForecastRecord>, AccessError> {
        self.owned_group(user, group_id).await?;
        Ok(self.store.list_by_group(group_id).await?)
    }

    pub async fn get(&self, user: UserId, id: ForecastId) -> Result<ForecastRecord, AccessError> {
        let record = self.store.get(id).await?.ok_or(AccessError::ForecastNotFound)?;
        match self.owned_group(user, record.group_id).await {
            Ok(_) => Ok(record),
            // The record outlived its group; nobody owns it any more.
            Err(AccessError::GroupNotFound) => Err(AccessError::Forbidden),
            Err(e) => Err(e),
        }
    }
}
