use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::debug;

use crate::features::{FeatureBundle, HISTORY_WINDOW};
use crate::kind::ForecastKind;
use crate::output::{ForecastOutput, SeriesForecast};
use crate::predictor::{PredictError, Predictor};

/// Assumed lay rate when a flock has no production history yet.
const DEFAULT_LAY_RATE: f64 = 0.9;

/// Number of most recent history days averaged into the baseline.
const BASELINE_DAYS: usize = 7;

/// Stand-in model: a heuristic decay/growth curve with simulated latency.
///
/// Model:
/// - Baseline = mean of the last 7 observed values for the forecast kind
///   (egg production falls back to 90% of head count without history).
/// - Eggs decline by 0.1/day, weight grows 1%/day of baseline, mortality stays flat.
/// - A small deterministic wobble stands in for noise.
/// - Counts are rounded and capped at the head count.
/// - Score grows with history coverage, within `[0.85, 0.95]`.
#[derive(Debug, Clone)]
pub struct DecayPredictor {
    latency: Duration,
}

impl Default for DecayPredictor {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(1),
        }
    }
}

impl DecayPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Compute a forecast whose first predicted day is `first_day`.
    pub fn forecast(
        &self,
        kind: ForecastKind,
        features: &FeatureBundle,
        model_name: &str,
        first_day: NaiveDate,
    ) -> Result<ForecastOutput, PredictError> {
        if model_name.trim().is_empty() {
            return Err(PredictError::InvalidInput("model name must not be empty".to_string()));
        }
        if features.horizon == 0 {
            return Err(PredictError::InvalidInput("horizon must be >= 1".to_string()));
        }

        let quantity = features.metadata.quantity.max(0) as f64;
        let observed: Vec<f64> = features
            .history
            .iter()
            .map(|h| match kind {
                ForecastKind::EggProduction => h.eggs as f64,
                ForecastKind::Growth => h.weight_kg,
                ForecastKind::Mortality => h.mortality as f64,
            })
            .collect();

        let baseline = match mean(tail(&observed, BASELINE_DAYS)) {
            Some(m) => m,
            None if kind == ForecastKind::EggProduction => quantity * DEFAULT_LAY_RATE,
            None => 0.0,
        };

        let daily_drift = match kind {
            ForecastKind::EggProduction => -0.1,
            ForecastKind::Growth => baseline * 0.01,
            ForecastKind::Mortality => 0.0,
        };
        let wobble_amplitude = (baseline * 0.02).min(2.5);

        let values: Vec<f64> = (0..features.horizon)
            .map(|i| {
                let raw = baseline + daily_drift * f64::from(i + 1) + wobble_amplitude * wobble(i);
                let v = raw.max(0.0);
                if kind.is_count() {
                    v.min(quantity).round()
                } else {
                    (v * 100.0).round() / 100.0
                }
            })
            .collect();

        let coverage = features.history.len().min(HISTORY_WINDOW) as f64 / HISTORY_WINDOW as f64;
        let score = 0.85 + 0.1 * coverage;

        Ok(ForecastOutput::new(
            kind,
            SeriesForecast::from_values(score, first_day, &values, 0.1),
        ))
    }
}

#[async_trait]
impl Predictor for DecayPredictor {
    async fn predict(
        &self,
        kind: ForecastKind,
        features: &FeatureBundle,
        model_name: &str,
    ) -> Result<ForecastOutput, PredictError> {
        debug!(
            model = model_name,
            kind = %kind,
            horizon = features.horizon,
            history = features.history.len(),
            "calling predictor"
        );

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let tomorrow = Utc::now().date_naive().succ_opt().ok_or_else(|| {
            PredictError::Failed("calendar overflow computing first forecast day".to_string())
        })?;

        self.forecast(kind, features, model_name, tomorrow)
    }
}

fn tail(xs: &[f64], n: usize) -> &[f64] {
    &xs[xs.len().saturating_sub(n)..]
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / (xs.len() as f64))
}

/// Deterministic value in `[-1, 1)` per day index.
fn wobble(i: u32) -> f64 {
    let pseudo_random = ((f64::from(i) * 17.0 + 7.0) % 100.0) / 100.0;
    (pseudo_random - 0.5) * 2.0
}
