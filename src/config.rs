//! Engine configuration
//!
//! Defaults mirror the engine contract; every value can be overridden through
//! `SERVICEDESK_*` environment variables (a `.env` file is loaded first by
//! `run()`).

use crate::sync::retry::{BackoffStrategy, RetryPolicy};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "SERVICEDESK_";

const SEVEN_DAYS_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables of the offline engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Store capacity before eviction
    pub max_queue_size: usize,
    /// Used when an action does not carry its own ceiling
    pub default_max_attempts: u32,
    pub batching_enabled: bool,
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Periodic safety-net pass
    pub sync_interval: Duration,
    /// Upper bound on a single dispatch
    pub dispatch_timeout: Duration,
    pub network_debounce: Duration,
    pub retry: RetryPolicy,
    /// `None` disables expiry
    pub max_queue_age: Option<Duration>,
    /// Reachability endpoint; when unset the engine starts online and relies
    /// on explicit `set_online` reports
    pub probe_url: Option<String>,
    pub probe_interval: Duration,
    pub wake_interval: Duration,
    /// Overrides the platform data directory
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            default_max_attempts: 3,
            batching_enabled: true,
            batch_size: 10,
            batch_delay: Duration::from_millis(100),
            sync_interval: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(30),
            network_debounce: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            max_queue_age: Some(Duration::from_secs(SEVEN_DAYS_SECS)),
            probe_url: None,
            probe_interval: Duration::from_secs(15),
            wake_interval: Duration::from_secs(300),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(SERVICEDESK_<NAME>)`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        if let Some(v) = env.parse("MAX_QUEUE_SIZE")? {
            config.max_queue_size = v;
        }
        if let Some(v) = env.parse("MAX_ATTEMPTS")? {
            config.default_max_attempts = v;
        }
        if let Some(v) = env.parse_bool("BATCHING")? {
            config.batching_enabled = v;
        }
        if let Some(v) = env.parse("BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = env.parse("BATCH_DELAY_MS")? {
            config.batch_delay = Duration::from_millis(v);
        }
        if let Some(v) = env.parse("SYNC_INTERVAL_SECS")? {
            config.sync_interval = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("DISPATCH_TIMEOUT_SECS")? {
            config.dispatch_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("NETWORK_DEBOUNCE_MS")? {
            config.network_debounce = Duration::from_millis(v);
        }
        if let Some(v) = env.parse::<u64>("MAX_QUEUE_AGE_SECS")? {
            config.max_queue_age = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = env.get("PROBE_URL") {
            config.probe_url = Some(v).filter(|url| !url.is_empty());
        }
        if let Some(v) = env.parse("PROBE_INTERVAL_SECS")? {
            config.probe_interval = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("WAKE_INTERVAL_SECS")? {
            config.wake_interval = Duration::from_secs(v);
        }
        if let Some(v) = env.get("DATA_DIR") {
            config.data_dir = Some(PathBuf::from(v));
        }

        config.retry = env.retry_policy()?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid("max_queue_size must be at least 1".to_string()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid("default_max_attempts must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::Invalid("sync_interval must be non-zero".to_string()));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(ConfigError::Invalid("dispatch_timeout must be non-zero".to_string()));
        }
        if let BackoffStrategy::Exponential { multiplier, .. } = self.retry.strategy {
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "retry multiplier must be >= 1.0, got {}",
                    multiplier
                )));
            }
        }
        Ok(())
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(&format!("{}{}", ENV_PREFIX, name)).map(|v| v.trim().to_string())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::InvalidValue {
                key: format!("{}{}", ENV_PREFIX, name),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn parse_bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(name).as_deref().map(str::to_ascii_lowercase).as_deref() {
            None => Ok(None),
            Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
            Some("0" | "false" | "no" | "off") => Ok(Some(false)),
            Some(other) => Err(ConfigError::InvalidValue {
                key: format!("{}{}", ENV_PREFIX, name),
                value: other.to_string(),
                reason: "expected true/false".to_string(),
            }),
        }
    }

    fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let defaults = RetryPolicy::default();
        let base = Duration::from_millis(self.parse("RETRY_BASE_MS")?.unwrap_or(1_000));

        let policy = match self.get("RETRY_STRATEGY").as_deref() {
            None | Some("exponential") => {
                let multiplier = self.parse("RETRY_MULTIPLIER")?.unwrap_or(2.0);
                RetryPolicy::exponential(base, multiplier)
            }
            Some("linear") => RetryPolicy::linear(base),
            Some("fixed") => RetryPolicy::fixed(base),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{}RETRY_STRATEGY", ENV_PREFIX),
                    value: other.to_string(),
                    reason: "expected fixed, linear or exponential".to_string(),
                })
            }
        };

        let max_delay = self
            .parse("RETRY_MAX_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(defaults.max_delay_ms));
        let abandon = self.parse_bool("ABANDON_CLIENT_ERRORS")?.unwrap_or(false);

        Ok(policy
            .with_max_delay(max_delay)
            .with_abandon_client_errors(abandon))
    }
}
