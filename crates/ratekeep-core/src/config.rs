//! Configuration for ratekeep.
//!
//! Defaults mirror a production deployment: three attempts with one second
//! initial backoff, a five-failure breaker that stays open for thirty
//! seconds, and a thirty minute cache TTL. Every value can be overridden by
//! a `RATEKEEP_*` environment variable.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ratekeep_warehouse::WarehouseConfig;
use serde::{Serialize, Serializer};

use crate::alert::{ConsumerConfig, DEFAULT_TOPIC};
use crate::cache::DEFAULT_CACHE_KEY;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::retry::{Backoff, RetryConfig};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateKeepConfig {
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub alert: AlertConfig,
    pub pools: PoolConfig,
    pub log: LogConfig,
    /// `None` uses `$RATEKEEP_HOME/ratekeep.duckdb`.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteConfig {
    pub source_id: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    #[serde(serialize_with = "millis")]
    pub timeout: Duration,
    /// Remote attempts allowed per minute; `None` disables the quota.
    pub quota_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    Memory,
    Duckdb,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheConfig {
    pub key: String,
    #[serde(serialize_with = "millis")]
    pub ttl: Duration,
    #[serde(serialize_with = "millis")]
    pub op_timeout: Duration,
    /// Serve an expired entry when the remote source is unavailable.
    pub stale_fallback: bool,
    pub backend: CacheBackendKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(serialize_with = "millis")]
    pub initial_backoff: Duration,
    pub multiplier: f64,
    #[serde(serialize_with = "millis")]
    pub max_backoff: Duration,
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    #[serde(serialize_with = "millis")]
    pub open_duration: Duration,
    #[serde(serialize_with = "millis")]
    pub call_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannelKind {
    Memory,
    Outbox,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertConfig {
    pub topic: String,
    pub channel: AlertChannelKind,
    pub handler_attempts: u32,
    #[serde(serialize_with = "millis")]
    pub poll_interval: Duration,
    pub batch_size: usize,
}

/// Bulkhead sizes per resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    pub remote: usize,
    pub cache: usize,
    pub alert: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogConfig {
    /// `EnvFilter` directive.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for RateKeepConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig {
                source_id: String::from("rate-api"),
                url: String::from("http://localhost:8080/api/percentage"),
                bearer_token: None,
                timeout: Duration::from_secs(20),
                quota_per_minute: None,
            },
            cache: CacheConfig {
                key: DEFAULT_CACHE_KEY.to_string(),
                ttl: Duration::from_secs(30 * 60),
                op_timeout: Duration::from_secs(5),
                stale_fallback: true,
                backend: CacheBackendKind::Duckdb,
            },
            retry: RetrySettings {
                max_attempts: 3,
                initial_backoff: Duration::from_secs(1),
                multiplier: 2.0,
                max_backoff: Duration::from_secs(30),
                jitter: false,
            },
            breaker: BreakerSettings {
                failure_threshold: 5,
                open_duration: Duration::from_secs(30),
                call_timeout: Duration::from_secs(10),
            },
            alert: AlertConfig {
                topic: DEFAULT_TOPIC.to_string(),
                channel: AlertChannelKind::Outbox,
                handler_attempts: 3,
                poll_interval: Duration::from_millis(500),
                batch_size: 32,
            },
            pools: PoolConfig {
                remote: 16,
                cache: 32,
                alert: 4,
            },
            log: LogConfig {
                filter: String::from("info"),
                format: LogFormat::Pretty,
            },
            db_path: None,
        }
    }
}

impl RateKeepConfig {
    /// Load configuration from `RATEKEEP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let vars = Vars { lookup: &lookup };

        if let Some(value) = vars.string("RATEKEEP_SOURCE_ID") {
            config.remote.source_id = value;
        }
        if let Some(value) = vars.string("RATEKEEP_REMOTE_URL") {
            config.remote.url = value;
        }
        if let Some(value) = vars.string("RATEKEEP_REMOTE_TOKEN") {
            config.remote.bearer_token = Some(value);
        }
        if let Some(value) = vars.millis("RATEKEEP_REMOTE_TIMEOUT_MS")? {
            config.remote.timeout = value;
        }
        if let Some(value) = vars.parse::<u32>("RATEKEEP_REMOTE_QUOTA_PER_MINUTE")? {
            config.remote.quota_per_minute = (value > 0).then_some(value);
        }

        if let Some(value) = vars.string("RATEKEEP_CACHE_KEY") {
            config.cache.key = value;
        }
        if let Some(value) = vars.parse::<u64>("RATEKEEP_CACHE_TTL_SECS")? {
            config.cache.ttl = Duration::from_secs(value);
        }
        if let Some(value) = vars.millis("RATEKEEP_CACHE_TIMEOUT_MS")? {
            config.cache.op_timeout = value;
        }
        if let Some(value) = vars.flag("RATEKEEP_STALE_FALLBACK")? {
            config.cache.stale_fallback = value;
        }
        if let Some(value) = vars.string("RATEKEEP_CACHE_BACKEND") {
            config.cache.backend = match value.to_ascii_lowercase().as_str() {
                "memory" => CacheBackendKind::Memory,
                "duckdb" => CacheBackendKind::Duckdb,
                _ => {
                    return Err(ConfigError::invalid(
                        "RATEKEEP_CACHE_BACKEND",
                        &value,
                        "expected 'memory' or 'duckdb'",
                    ))
                }
            };
        }

        if let Some(value) = vars.parse::<u32>("RATEKEEP_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = value;
        }
        if let Some(value) = vars.millis("RATEKEEP_RETRY_INITIAL_BACKOFF_MS")? {
            config.retry.initial_backoff = value;
        }
        if let Some(value) = vars.parse::<f64>("RATEKEEP_RETRY_MULTIPLIER")? {
            config.retry.multiplier = value;
        }
        if let Some(value) = vars.millis("RATEKEEP_RETRY_MAX_BACKOFF_MS")? {
            config.retry.max_backoff = value;
        }
        if let Some(value) = vars.flag("RATEKEEP_RETRY_JITTER")? {
            config.retry.jitter = value;
        }

        if let Some(value) = vars.parse::<u32>("RATEKEEP_BREAKER_FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = value;
        }
        if let Some(value) = vars.parse::<u64>("RATEKEEP_BREAKER_OPEN_SECS")? {
            config.breaker.open_duration = Duration::from_secs(value);
        }
        if let Some(value) = vars.millis("RATEKEEP_BREAKER_CALL_TIMEOUT_MS")? {
            config.breaker.call_timeout = value;
        }

        if let Some(value) = vars.string("RATEKEEP_ALERT_TOPIC") {
            config.alert.topic = value;
        }
        if let Some(value) = vars.string("RATEKEEP_ALERT_CHANNEL") {
            config.alert.channel = match value.to_ascii_lowercase().as_str() {
                "memory" => AlertChannelKind::Memory,
                "outbox" => AlertChannelKind::Outbox,
                _ => {
                    return Err(ConfigError::invalid(
                        "RATEKEEP_ALERT_CHANNEL",
                        &value,
                        "expected 'memory' or 'outbox'",
                    ))
                }
            };
        }
        if let Some(value) = vars.parse::<u32>("RATEKEEP_ALERT_HANDLER_ATTEMPTS")? {
            config.alert.handler_attempts = value;
        }
        if let Some(value) = vars.millis("RATEKEEP_ALERT_POLL_MS")? {
            config.alert.poll_interval = value;
        }
        if let Some(value) = vars.parse::<usize>("RATEKEEP_ALERT_BATCH_SIZE")? {
            config.alert.batch_size = value;
        }

        if let Some(value) = vars.parse::<usize>("RATEKEEP_POOL_REMOTE")? {
            config.pools.remote = value;
        }
        if let Some(value) = vars.parse::<usize>("RATEKEEP_POOL_CACHE")? {
            config.pools.cache = value;
        }
        if let Some(value) = vars.parse::<usize>("RATEKEEP_POOL_ALERT")? {
            config.pools.alert = value;
        }

        if let Some(value) = vars.string("RATEKEEP_DB_PATH") {
            config.db_path = Some(PathBuf::from(value));
        }
        if let Some(value) = vars.string("RATEKEEP_LOG") {
            config.log.filter = value;
        }
        if let Some(value) = vars.string("RATEKEEP_LOG_FORMAT") {
            config.log.format = match value.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => {
                    return Err(ConfigError::invalid(
                        "RATEKEEP_LOG_FORMAT",
                        &value,
                        "expected 'json' or 'pretty'",
                    ))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("RATEKEEP_RETRY_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "RATEKEEP_RETRY_MULTIPLIER",
                &self.retry.multiplier.to_string(),
                "must be a finite number >= 1.0",
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "RATEKEEP_BREAKER_FAILURE_THRESHOLD",
                "0",
                "must be at least 1",
            ));
        }
        if self.cache.op_timeout.is_zero() {
            return Err(ConfigError::invalid("RATEKEEP_CACHE_TIMEOUT_MS", "0", "must be positive"));
        }
        if self.breaker.call_timeout.is_zero() {
            return Err(ConfigError::invalid("RATEKEEP_BREAKER_CALL_TIMEOUT_MS", "0", "must be positive"));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            backoff: Backoff::Exponential {
                base: self.retry.initial_backoff,
                factor: self.retry.multiplier,
                max: self.retry.max_backoff,
                jitter: self.retry.jitter,
            },
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            open_duration: self.breaker.open_duration,
            call_timeout: self.breaker.call_timeout,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            topic: self.alert.topic.clone(),
            poll_interval: self.alert.poll_interval,
            batch_size: self.alert.batch_size,
            handler_attempts: self.alert.handler_attempts,
        }
    }

    pub fn warehouse_config(&self) -> WarehouseConfig {
        match &self.db_path {
            Some(path) => WarehouseConfig::at_path(path.clone()),
            None => WarehouseConfig::default(),
        }
    }

    /// Whether any component needs the DuckDB warehouse.
    pub fn needs_warehouse(&self) -> bool {
        self.cache.backend == CacheBackendKind::Duckdb || self.alert.channel == AlertChannelKind::Outbox
    }
}

struct Vars<'a, F> {
    lookup: &'a F,
}

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(key)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|error| ConfigError::invalid(key, &value, error.to_string()))
            })
            .transpose()
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.string(key)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, &value, "expected a boolean")),
            })
            .transpose()
    }
}

fn millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
