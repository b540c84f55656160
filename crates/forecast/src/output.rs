use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::kind::ForecastKind;
use crate::predictor::PredictError;

/// One predicted day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionPoint {
    pub date: NaiveDate,
    pub predicted_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastSummary {
    /// Mean of the first (up to) seven predicted values.
    pub avg_next_7_days: f64,
    /// `[low, high]` band around the end of the horizon, to two decimals.
    pub confidence_interval: [f64; 2],
}

/// Kind-independent body of a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesForecast {
    /// Quality/confidence in `[0, 1]`.
    pub score: f64,
    pub predictions: Vec<PredictionPoint>,
    pub summary: ForecastSummary,
}

impl SeriesForecast {
    /// Build a series from predicted values starting at `first_day`, deriving the summary.
    pub fn from_values(score: f64, first_day: NaiveDate, values: &[f64], band: f64) -> Self {
        let predictions: Vec<PredictionPoint> = first_day
            .iter_days()
            .zip(values.iter().copied())
            .map(|(date, predicted_value)| PredictionPoint { date, predicted_value })
            .collect();

        let head = &values[..values.len().min(7)];
        let avg_next_7_days = if head.is_empty() {
            0.0
        } else {
            head.iter().sum::<f64>() / head.len() as f64
        };

        let last = values.last().copied().unwrap_or(0.0);
        Self {
            score,
            predictions,
            summary: ForecastSummary {
                avg_next_7_days,
                confidence_interval: [round2(last * (1.0 - band)), round2(last * (1.0 + band))],
            },
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Result of a forecast, tagged by what was predicted.
///
/// Persisted as the record's `outputJson`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForecastOutput {
    EggProduction(SeriesForecast),
    Growth(SeriesForecast),
    Mortality(SeriesForecast),
}

impl ForecastOutput {
    pub fn new(kind: ForecastKind, series: SeriesForecast) -> Self {
        match kind {
            ForecastKind::EggProduction => ForecastOutput::EggProduction(series),
            ForecastKind::Growth => ForecastOutput::Growth(series),
            ForecastKind::Mortality => ForecastOutput::Mortality(series),
        }
    }

    pub fn kind(&self) -> ForecastKind {
        match self {
            ForecastOutput::EggProduction(_) => ForecastKind::EggProduction,
            ForecastOutput::Growth(_) => ForecastKind::Growth,
            ForecastOutput::Mortality(_) => ForecastKind::Mortality,
        }
    }

    pub fn series(&self) -> &SeriesForecast {
        match self {
            ForecastOutput::EggProduction(s) | ForecastOutput::Growth(s) | ForecastOutput::Mortality(s) => s,
        }
    }

    pub fn score(&self) -> f64 {
        self.series().score
    }

    pub fn predictions(&self) -> &[PredictionPoint] {
        &self.series().predictions
    }

    /// Check the predictor contract before the output is persisted.
    ///
    /// - the variant matches the requested kind
    /// - `score` is finite and in `[0, 1]`
    /// - exactly `horizon` points, on consecutive days starting at `first_day`
    /// - every value is finite
    pub fn validate(
        &self,
        kind: ForecastKind,
        horizon: u32,
        first_day: NaiveDate,
    ) -> Result<(), PredictError> {
        if self.kind() != kind {
            return Err(PredictError::ContractViolation(format!(
                "predictor returned {} output for a {} forecast",
                self.kind(),
                kind
            )));
        }

        let series = self.series();
        if !(series.score.is_finite() && (0.0..=1.0).contains(&series.score)) {
            return Err(PredictError::ContractViolation(format!(
                "score {} outside [0, 1]",
                series.score
            )));
        }

        if series.predictions.len() != horizon as usize {
            return Err(PredictError::ContractViolation(format!(
                "expected {horizon} predictions, got {}",
                series.predictions.len()
            )));
        }

        for (expected, point) in first_day.iter_days().zip(&series.predictions) {
            if point.date != expected {
                return Err(PredictError::ContractViolation(format!(
                    "prediction dated {} where {} was expected",
                    point.date, expected
                )));
            }
            if !point.predicted_value.is_finite() {
                return Err(PredictError::ContractViolation(format!(
                    "non-finite prediction on {}",
                    point.date
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn summary_averages_first_week_only() {
        let values = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 100.0];
        let s = SeriesForecast::from_values(0.9, day("2026-01-01"), &values, 0.1);
        assert_eq!(s.summary.avg_next_7_days, 10.0);
        assert_eq!(s.summary.confidence_interval, [90.0, 110.0]);
        assert_eq!(s.predictions.last().unwrap().date, day("2026-01-08"));
    }

    #[test]
    fn interval_bounds_are_rounded() {
        let s = SeriesForecast::from_values(0.9, day("2026-01-01"), &[47.123], 0.1);
        assert_eq!(s.summary.confidence_interval, [42.41, 51.84]);
    }

    #[test]
    fn short_horizon_averages_what_exists() {
        let s = SeriesForecast::from_values(0.9, day("2026-01-01"), &[4.0, 6.0], 0.1);
        assert_eq!(s.summary.avg_next_7_days, 5.0);
    }

    #[test]
    fn serialises_with_type_tag_and_camel_case() {
        let s = SeriesForecast::from_values(0.9, day("2026-03-01"), &[1.0], 0.0);
        let out = ForecastOutput::new(ForecastKind::EggProduction, s);
        let v = serde_json::to_value(&out).unwrap();

        assert_eq!(v["type"], "egg_production");
        assert_eq!(v["score"], json!(0.9));
        assert_eq!(v["predictions"][0]["date"], "2026-03-01");
        assert_eq!(v["predictions"][0]["predictedValue"], json!(1.0));
        assert!(v["summary"]["avgNext7Days"].is_number());

        let back: ForecastOutput = serde_json::from_value(v).unwrap();
        assert_eq!(back, out);
    }

    #[test]
    fn validate_rejects_wrong_length_and_gaps() {
        let start = day("2026-01-01");
        let out = ForecastOutput::new(
            ForecastKind::Growth,
            SeriesForecast::from_values(0.9, start, &[1.0, 2.0], 0.1),
        );
        assert!(out.validate(ForecastKind::Growth, 2, start).is_ok());
        assert!(out.validate(ForecastKind::Growth, 3, start).is_err());
        assert!(out.validate(ForecastKind::Growth, 2, day("2026-01-02")).is_err());
        assert!(out.validate(ForecastKind::Mortality, 2, start).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_score() {
        let start = day("2026-01-01");
        let out = ForecastOutput::new(
            ForecastKind::Mortality,
            SeriesForecast::from_values(1.5, start, &[0.0], 0.1),
        );
        assert!(matches!(
            out.validate(ForecastKind::Mortality, 1, start),
            Err(PredictError::ContractViolation(_))
        ));
    }
}
