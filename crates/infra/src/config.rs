//! Configuration loading and representation.
//!
//! Everything is read once from the environment into typed structs. Unset
//! variables take defaults; set-but-unparseable variables are errors.

use std::time::Duration;

use crate::jobs::{QueueSettings, RetryPolicy};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} is required when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

#[derive(Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Takes precedence over host/port/password when set.
    pub url: Option<String>,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(pw) => format!("redis://:{pw}@{}:{}", self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

/// Knobs for the producer, queue and worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub queue_name: String,
    pub default_model: String,
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
    pub enqueue_attempts: u32,
    pub predictor_latency: Duration,
    /// `None` disables the stale-running sweep.
    pub sweep_stale_after: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_name: "animal-forecast".to_string(),
            default_model: "default-model".to_string(),
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(60),
            max_deliveries: 5,
            enqueue_attempts: 3,
            predictor_latency: Duration::from_secs(1),
            sweep_stale_after: None,
        }
    }
}

impl PipelineConfig {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings::default()
            .with_name(self.queue_name.clone())
            .with_visibility_timeout(self.visibility_timeout)
            .with_retry(RetryPolicy::exponential(
                self.max_deliveries,
                Duration::from_secs(1),
                Duration::from_secs(60),
            ))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub jwt_secret: Option<String>,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    /// Create the farm history tables on startup (local databases only).
    pub bootstrap_farm_schema: bool,
    pub redis: RedisConfig,
    pub pipeline: PipelineConfig,
    pub run_embedded_worker: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = PipelineConfig::default();

        let use_persistent_stores = parse_bool(&get, "USE_PERSISTENT_STORES", false)?;
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let pipeline = PipelineConfig {
            queue_name: get("FORECAST_QUEUE_NAME").unwrap_or(defaults.queue_name),
            default_model: get("FORECAST_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            worker_concurrency: parse(&get, "FORECAST_WORKER_CONCURRENCY", defaults.worker_concurrency)?
                .max(1),
            poll_interval: Duration::from_millis(parse(&get, "FORECAST_POLL_INTERVAL_MS", 250u64)?),
            visibility_timeout: Duration::from_secs(parse(&get, "FORECAST_VISIBILITY_TIMEOUT_SECS", 60u64)?),
            max_deliveries: parse(&get, "FORECAST_MAX_DELIVERIES", defaults.max_deliveries)?.max(1),
            enqueue_attempts: parse(&get, "FORECAST_ENQUEUE_ATTEMPTS", defaults.enqueue_attempts)?.max(1),
            predictor_latency: Duration::from_millis(parse(&get, "FORECAST_PREDICTOR_LATENCY_MS", 1000u64)?),
            sweep_stale_after: match get("FORECAST_SWEEP_STALE_AFTER_SECS") {
                Some(_) => Some(Duration::from_secs(parse(&get, "FORECAST_SWEEP_STALE_AFTER_SECS", 0u64)?)),
                None => None,
            },
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            jwt_secret: get("JWT_SECRET"),
            use_persistent_stores,
            database_url,
            bootstrap_farm_schema: parse_bool(&get, "FARM_SCHEMA_BOOTSTRAP", false)?,
            redis: RedisConfig {
                host: get("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse(&get, "REDIS_PORT", 6379u16)?,
                password: get("REDIS_PASSWORD"),
                url: get("REDIS_URL"),
            },
            pipeline,
            run_embedded_worker: parse_bool(&get, "RUN_EMBEDDED_WORKER", !use_persistent_stores)?,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            key,
            value: v,
            reason: "expected a boolean".to_string(),
        }),
    }
}
