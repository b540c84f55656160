//! `farmflow-forecast`
//!
//! **Responsibility:** the forecasting domain, independent of storage and transport.
//!
//! - [`ForecastRecord`] and its one-directional status machine
//! - [`FeatureBuilder`]: recent farm history → [`FeatureBundle`]
//! - [`Predictor`]: the swappable prediction strategy, with [`DecayPredictor`] as the
//!   shipped stand-in model
//!
//! Persistence, queueing and HTTP live in `farmflow-infra` / `farmflow-api`.

pub mod decay;
pub mod features;
pub mod history;
pub mod kind;
pub mod output;
pub mod predictor;
pub mod record;
pub mod status;

pub use decay::DecayPredictor;
pub use features::{FeatureBuilder, FeatureBundle, FeatureError, FeedFeature, GroupMetadata, HistoryFeature, HISTORY_WINDOW};
pub use history::{AnimalGroup, FarmDataError, FarmDataReader, FeedRecord, ProductionRecord};
pub use kind::ForecastKind;
pub use output::{ForecastOutput, ForecastSummary, PredictionPoint, SeriesForecast};
pub use predictor::{PredictError, Predictor};
pub use record::{ForecastRecord, Lease, LeaseToken, NewForecast};
pub use status::{ForecastStatus, TransitionError};
