use core::str::FromStr;

use serde::{Deserialize, Serialize};

use farmflow_core::DomainError;

/// What a forecast predicts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastKind {
    /// Eggs laid per day.
    EggProduction,
    /// Average live weight (kg).
    Growth,
    /// Deaths per day.
    Mortality,
}

impl ForecastKind {
    pub const ALL: [ForecastKind; 3] = [
        ForecastKind::EggProduction,
        ForecastKind::Growth,
        ForecastKind::Mortality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastKind::EggProduction => "egg_production",
            ForecastKind::Growth => "growth",
            ForecastKind::Mortality => "mortality",
        }
    }

    /// Whether predicted values are whole counts (eggs, deaths) rather than measurements.
    pub fn is_count(&self) -> bool {
        !matches!(self, ForecastKind::Growth)
    }
}

impl core::fmt::Display for ForecastKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForecastKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ForecastKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "type must be one of: egg_production, growth, mortality (got '{s}')"
                ))
            })
    }
}
