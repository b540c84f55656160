//! Forecast lifecycle: `pending → running → {completed | failed}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a forecast record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastStatus {
    /// Created by the producer, waiting for a worker.
    Pending,
    /// Held by a worker.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished without a result.
    Failed,
}

impl ForecastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastStatus::Pending => "pending",
            ForecastStatus::Running => "running",
            ForecastStatus::Completed => "completed",
            ForecastStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ForecastStatus::Pending),
            "running" => Some(ForecastStatus::Running),
            "completed" => Some(ForecastStatus::Completed),
            "failed" => Some(ForecastStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ForecastStatus::Completed | ForecastStatus::Failed)
    }

    /// Position in the lifecycle; never decreases for a given record.
    pub fn rank(&self) -> u8 {
        match self {
            ForecastStatus::Pending => 0,
            ForecastStatus::Running => 1,
            ForecastStatus::Completed | ForecastStatus::Failed => 2,
        }
    }

    /// Whether `self → next` is a legal edge.
    ///
    /// `pending → failed` exists for records whose job could never be enqueued.
    pub fn can_transition_to(&self, next: ForecastStatus) -> bool {
        matches!(
            (self, next),
            (ForecastStatus::Pending, ForecastStatus::Running)
                | (ForecastStatus::Pending, ForecastStatus::Failed)
                | (ForecastStatus::Running, ForecastStatus::Completed)
                | (ForecastStatus::Running, ForecastStatus::Failed)
        )
    }
}

impl core::fmt::Display for ForecastStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected status change. Losing one is not fatal: it means another actor
/// owns (or already finished) the record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        from: ForecastStatus,
        to: ForecastStatus,
    },

    #[error("record is leased by another delivery")]
    LeaseHeld,

    #[error("lease token does not match the current holder")]
    LeaseMismatch,
}
