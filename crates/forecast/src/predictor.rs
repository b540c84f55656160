use async_trait::async_trait;
use thiserror::Error;

use crate::features::FeatureBundle;
use crate::kind::ForecastKind;
use crate::output::ForecastOutput;

/// A prediction strategy.
///
/// Implementations may be slow (remote model serving); callers must not await
/// them on a request/response path. Errors are surfaced, never swallowed.
#[async_trait]
pub trait Predictor: Send + Sync + 'static {
    /// Predict `features.horizon` consecutive days starting tomorrow.
    async fn predict(
        &self,
        kind: ForecastKind,
        features: &FeatureBundle,
        model_name: &str,
    ) -> Result<ForecastOutput, PredictError>;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictError {
    #[error("invalid predictor input: {0}")]
    InvalidInput(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("prediction failed: {0}")]
    Failed(String),

    #[error("predictor output violates contract: {0}")]
    ContractViolation(String),
}
