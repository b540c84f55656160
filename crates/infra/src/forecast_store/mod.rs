//! Persistence for forecast records.
//!
//! Every write is conditional on the record's current status (and lease), so
//! concurrent writers can never move a record backwards or overwrite a
//! terminal result. A write that loses reports [`Transition::Lost`].

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;

use farmflow_core::{ForecastId, GroupId};
use farmflow_forecast::{ForecastOutput, ForecastRecord, ForecastStatus, LeaseToken, NewForecast};

pub use in_memory::InMemoryForecastStore;
pub use postgres::PostgresForecastStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("forecast store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt forecast row {id}: {reason}")]
    Corrupt { id: ForecastId, reason: String },
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied,
    /// Precondition failed; `current` is the status observed afterwards
    /// (`None` if the record does not exist).
    Lost { current: Option<ForecastStatus> },
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

#[async_trait]
pub trait ForecastStore: Send + Sync + 'static {
    /// Persist a new record; status is always `pending`.
    async fn create(&self, new: NewForecast) -> Result<ForecastRecord, StoreError>;

    async fn get(&self, id: ForecastId) -> Result<Option<ForecastRecord>, StoreError>;

    /// Newest first.
    async fn list_by_group(&self, group_id: GroupId) -> Result<Vec<ForecastRecord>, StoreError>;

    /// `pending → running` (or take over a running record whose lease lapsed).
    async fn transition_to_running(
        &self,
        id: ForecastId,
        lease: &LeaseToken,
        ttl: Duration,
    ) -> Result<Transition, StoreError>;

    /// `running → completed` for the lease holder; stores output, score and run time.
    async fn complete(
        &self,
        id: ForecastId,
        lease: &LeaseToken,
        output: ForecastOutput,
    ) -> Result<Transition, StoreError>;

    /// `running → failed` for the lease holder.
    async fn fail(&self, id: ForecastId, lease: &LeaseToken, reason: &str) -> Result<Transition, StoreError>;

    /// `pending → failed` for a record whose job never reached the queue.
    async fn fail_pending(&self, id: ForecastId, reason: &str) -> Result<Transition, StoreError>;

    /// Fail `running` records whose lease lapsed more than `older_than` ago.
    async fn sweep_stale_running(&self, older_than: Duration) -> Result<Vec<ForecastId>, StoreError>;
}

/// Clamp a std duration into chrono's range.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
