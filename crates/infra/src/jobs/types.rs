//! Queue payloads, deliveries and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use farmflow_core::{ForecastId, GroupId};
use farmflow_forecast::{ForecastKind, LeaseToken};

/// Queue message for one forecast run.
///
/// A pointer to the persisted record: the worker re-reads state from the
/// store, so the payload only carries what the run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastJob {
    pub forecast_id: ForecastId,
    pub group_id: GroupId,
    #[serde(rename = "type")]
    pub kind: ForecastKind,
    pub model: String,
    pub horizon_days: u32,
    #[serde(default)]
    pub input_overrides: Map<String, JsonValue>,
}

/// One delivery of a job to a consumer.
///
/// `attempt` starts at 1 and grows on every redelivery of the same message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    pub attempt: u32,
    pub job: ForecastJob,
}

impl Delivery {
    /// Lease token used for record-level compare-and-swap; unique per delivery.
    pub fn lease_token(&self) -> LeaseToken {
        LeaseToken::new(format!("{}#{}", self.message_id, self.attempt))
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job for the same forecast id was already accepted; nothing was added.
    Duplicate,
}

/// What the queue did with a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Will be delivered again no earlier than `after`.
    Retrying { after: Duration },
    DeadLettered,
    /// The delivery was no longer current (timed out and handed to someone else).
    Superseded,
}

/// Queue identity and delivery policy.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    /// How long a delivery stays invisible before it is handed out again.
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "animal-forecast".to_string(),
            visibility_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueSettings {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1), capped at `max_delay`
    #[default]
    Exponential,
}

/// Retry policy applied by the queue to failed deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total deliveries allowed before dead-lettering (0 and 1 both mean "no retries")
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that dead-letters on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before redelivering after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a delivery that failed on `attempt` may be delivered again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A job that exhausted its deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub message_id: String,
    pub job: ForecastJob,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}
