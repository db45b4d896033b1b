//! YAML configuration for platforms and coordinators
//!
//! Durations are written the way users write them in `configuration.yaml`:
//! a number of seconds (`scan_interval: 30`) or a clock string
//! (`scan_interval: "00:05"` for five minutes, `"01:00:30"`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::entity_platform::{
    PLATFORM_NOT_READY_BASE_WAIT, SLOW_SETUP_MAX_WAIT, SLOW_SETUP_WARNING,
};
use crate::error::{ConfigError, ConfigResult};
use crate::update_coordinator::{
    REQUEST_REFRESH_DEFAULT_COOLDOWN, REQUEST_REFRESH_DEFAULT_IMMEDIATE,
};

/// Parse `"HH:MM"`, `"HH:MM:SS"` or a plain number of seconds
pub fn parse_time_period(value: &str) -> ConfigResult<Duration> {
    let invalid = || ConfigError::InvalidTimePeriod(value.to_string());
    let value = value.trim();

    if let Ok(seconds) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).map_err(|_| invalid());
    }

    let parts: Vec<&str> = value.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(invalid());
    }
    let mut numbers = Vec::with_capacity(3);
    for part in &parts {
        numbers.push(part.parse::<u64>().map_err(|_| invalid())?);
    }
    let (hours, minutes) = (numbers[0], numbers[1]);
    let seconds = numbers.get(2).copied().unwrap_or(0);

    Ok(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimePeriod {
    Seconds(f64),
    Text(String),
}

impl RawTimePeriod {
    fn into_duration(self) -> ConfigResult<Duration> {
        match self {
            RawTimePeriod::Seconds(seconds) => Duration::try_from_secs_f64(seconds)
                .map_err(|_| ConfigError::InvalidTimePeriod(seconds.to_string())),
            RawTimePeriod::Text(text) => parse_time_period(&text),
        }
    }
}

/// `#[serde(with = "time_period")]` for `Duration` fields
pub mod time_period {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        RawTimePeriod::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

/// `#[serde(with = "time_period_opt")]` for `Option<Duration>` fields
pub mod time_period_opt {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<RawTimePeriod>::deserialize(deserializer)?
            .map(RawTimePeriod::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}

fn default_setup_timeout() -> Duration {
    SLOW_SETUP_MAX_WAIT
}

fn default_not_ready_base_wait() -> Duration {
    PLATFORM_NOT_READY_BASE_WAIT
}

fn default_slow_setup_warning() -> Duration {
    SLOW_SETUP_WARNING
}

/// One entry under a domain's platform list, e.g.
///
/// ```yaml
/// sensor:
///   - platform: demo
///     scan_interval: 30
///     parallel_updates: 0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Integration providing the entities
    pub platform: String,

    /// Poll period; falls back to the integration's own, then 15 seconds
    #[serde(default, with = "time_period_opt", skip_serializing_if = "Option::is_none")]
    pub scan_interval: Option<Duration>,

    /// Max concurrent entity updates; `0` means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_updates: Option<usize>,

    /// Prefix for generated object ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_namespace: Option<String>,

    #[serde(default = "default_setup_timeout", with = "time_period")]
    pub setup_timeout: Duration,

    /// Retry `n` waits `min(n, 6)` times this
    #[serde(default = "default_not_ready_base_wait", with = "time_period")]
    pub not_ready_base_wait: Duration,

    #[serde(default = "default_slow_setup_warning", with = "time_period")]
    pub slow_setup_warning: Duration,

    /// Integration specific keys
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl PlatformConfig {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            scan_interval: None,
            parallel_updates: None,
            entity_namespace: None,
            setup_timeout: SLOW_SETUP_MAX_WAIT,
            not_ready_base_wait: PLATFORM_NOT_READY_BASE_WAIT,
            slow_setup_warning: SLOW_SETUP_WARNING,
            extra: HashMap::new(),
        }
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = Some(scan_interval);
        self
    }

    pub fn with_parallel_updates(mut self, parallel_updates: usize) -> Self {
        self.parallel_updates = Some(parallel_updates);
        self
    }

    pub fn with_entity_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.entity_namespace = Some(namespace.into());
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_not_ready_base_wait(mut self, wait: Duration) -> Self {
        self.not_ready_base_wait = wait;
        self
    }

    /// Typed lookup of an integration specific key
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extra
            .get(key)
            .and_then(|v| serde_yaml::from_value(v.clone()).ok())
    }
}

fn default_cooldown() -> Duration {
    REQUEST_REFRESH_DEFAULT_COOLDOWN
}

fn default_immediate() -> bool {
    REQUEST_REFRESH_DEFAULT_IMMEDIATE
}

/// Settings for a [`crate::DataUpdateCoordinator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Used in log messages
    pub name: String,

    /// `None` disables automatic refreshes
    #[serde(default, with = "time_period_opt", skip_serializing_if = "Option::is_none")]
    pub update_interval: Option<Duration>,

    /// Window in which `async_request_refresh` calls are collapsed
    #[serde(default = "default_cooldown", with = "time_period")]
    pub request_refresh_cooldown: Duration,

    /// Run the first requested refresh right away instead of at the end of
    /// the window
    #[serde(default = "default_immediate")]
    pub request_refresh_immediate: bool,
}

impl CoordinatorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            update_interval: None,
            request_refresh_cooldown: REQUEST_REFRESH_DEFAULT_COOLDOWN,
            request_refresh_immediate: REQUEST_REFRESH_DEFAULT_IMMEDIATE,
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    pub fn with_request_refresh(mut self, cooldown: Duration, immediate: bool) -> Self {
        self.request_refresh_cooldown = cooldown;
        self.request_refresh_immediate = immediate;
        self
    }
}

/// Read and deserialize a YAML file
pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> ConfigResult<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        source,
    })
}
