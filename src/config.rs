//! TOML configuration for the mirror.
//!
//! Every field is optional; anything left out falls back to the built-in
//! default. The file is looked up at:
//!
//! 1. the path given with `--config`
//! 2. `$XDG_CONFIG_HOME/ipsw-downloader/config.toml`
//! 3. `$HOME/.config/ipsw-downloader/config.toml`
//!
//! A missing file at a default location is not an error.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::catalog::{
    DEFAULT_API_BASE_URL, DEFAULT_CUTOFF_YEAR, DEFAULT_DEVICE_FILTERS, DeviceFilter,
    default_release_years,
};
use crate::download::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_PROGRESS_INTERVAL, DEFAULT_RETRY_STATUSES,
    EngineOptions, RetryPolicy,
};

const APP_DIR: &str = "ipsw-downloader";
const CONFIG_FILE: &str = "config.toml";

/// Failures while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Retry settings for the shared HTTP session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per request, including the first.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound of random jitter added to each delay.
    pub jitter_ms: u64,
    /// HTTP statuses that are retried.
    pub statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 1_000,
            max_delay_ms: 120_000,
            jitter_ms: 0,
            statuses: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Catalog API base URL.
    pub api_base_url: String,
    /// Directory firmware images are stored in.
    pub storage_dir: PathBuf,
    /// Live progress file, rewritten on every update.
    pub progress_log: PathBuf,
    /// Append-only detailed log.
    pub detailed_log: PathBuf,
    /// Simultaneous downloads.
    pub concurrency: usize,
    /// Successful downloads between pauses; `0` disables pausing.
    pub batch_pause_every: usize,
    /// Pause length in seconds.
    pub batch_pause_secs: u64,
    /// Device name substrings to mirror.
    pub device_filters: Vec<String>,
    /// Earliest release year to mirror.
    pub cutoff_year: u16,
    /// Identifier to release-year table; replaces the built-in table when set.
    pub release_years: BTreeMap<String, u16>,
    /// Local wall-clock time of the daily run.
    #[serde(with = "hh_mm")]
    pub schedule_time: NaiveTime,
    /// How often the scheduler checks the clock, in seconds.
    pub poll_interval_secs: u64,
    /// Run once immediately at startup.
    pub run_on_startup: bool,
    /// HTTP retry settings.
    pub retry: RetryConfig,
    /// Per-read request timeout in seconds.
    pub request_timeout_secs: u64,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Links to the log viewer, appended to notifications.
    pub viewer_links: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            storage_dir: PathBuf::from("./ipsw"),
            progress_log: PathBuf::from("./logs/download_progress.log"),
            detailed_log: PathBuf::from("./logs/detailed_logging.log"),
            concurrency: crate::download::DEFAULT_CONCURRENCY,
            batch_pause_every: crate::download::DEFAULT_BATCH_PAUSE_EVERY,
            batch_pause_secs: crate::download::DEFAULT_BATCH_PAUSE.as_secs(),
            device_filters: DEFAULT_DEVICE_FILTERS.iter().map(ToString::to_string).collect(),
            cutoff_year: DEFAULT_CUTOFF_YEAR,
            release_years: default_release_years(),
            schedule_time: NaiveTime::MIN,
            poll_interval_secs: 60,
            run_on_startup: true,
            retry: RetryConfig::default(),
            request_timeout_secs: 60,
            connect_timeout_secs: 30,
            viewer_links: Vec::new(),
        }
    }
}

impl Config {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys, and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match Url::parse(&self.api_base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && !url.cannot_be_a_base() => {}
            _ => {
                return Err(ConfigError::invalid(
                    "api_base_url",
                    format!("'{}' is not an http(s) URL", self.api_base_url),
                ));
            }
        }

        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("storage_dir", "must not be empty"));
        }
        if self.progress_log.as_os_str().is_empty() {
            return Err(ConfigError::invalid("progress_log", "must not be empty"));
        }
        if self.detailed_log.as_os_str().is_empty() {
            return Err(ConfigError::invalid("detailed_log", "must not be empty"));
        }

        check_range("concurrency", self.concurrency, 1..=64)?;
        check_range("batch_pause_secs", self.batch_pause_secs, 0..=3600)?;
        check_range("poll_interval_secs", self.poll_interval_secs, 1..=3600)?;
        check_range("request_timeout_secs", self.request_timeout_secs, 1..=3600)?;
        check_range("connect_timeout_secs", self.connect_timeout_secs, 1..=3600)?;

        if self.device_filters.is_empty() || self.device_filters.iter().any(String::is_empty) {
            return Err(ConfigError::invalid(
                "device_filters",
                "must list at least one non-empty name substring",
            ));
        }

        check_range("retry.max_attempts", self.retry.max_attempts, 1..=20)?;
        check_range("retry.max_delay_ms", self.retry.max_delay_ms, 0..=3_600_000)?;
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                format!(
                    "{} exceeds retry.max_delay_ms ({})",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            ));
        }
        check_range("retry.jitter_ms", self.retry.jitter_ms, 0..=60_000)?;
        if let Some(status) = self.retry.statuses.iter().find(|s| !(100..=599).contains(*s)) {
            return Err(ConfigError::invalid(
                "retry.statuses",
                format!("{status} is not an HTTP status code"),
            ));
        }

        Ok(())
    }

    /// Device selection derived from this config.
    #[must_use]
    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            name_filters: self.device_filters.clone(),
            cutoff_year: self.cutoff_year,
            release_years: self.release_years.clone(),
        }
    }

    /// Engine tunables derived from this config.
    #[must_use]
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            concurrency: self.concurrency,
            batch_pause_every: self.batch_pause_every,
            batch_pause: Duration::from_secs(self.batch_pause_secs),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// HTTP retry policy derived from this config.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            2.0,
        )
        .with_retry_statuses(self.retry.statuses.clone())
        .with_max_jitter(Duration::from_millis(self.retry.jitter_ms))
    }

    /// Per-read request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// TCP connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Scheduler poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn check_range<T>(
    field: &'static str,
    value: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!(
                "{value}. Expected range: {}..={}",
                range.start(),
                range.end()
            ),
        ))
    }
}

/// Configuration together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The effective configuration.
    pub config: Config,
    /// Path that was consulted, if one could be resolved.
    pub path: Option<PathBuf>,
    /// Whether `path` existed and was parsed.
    pub loaded_from_file: bool,
}

/// Loads configuration from `explicit`, or from the default location.
///
/// # Errors
///
/// Returns [`ConfigError`] if an explicitly given file is missing, or if any
/// file that exists cannot be read, parsed, or validated.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path(),
    };

    let Some(path_ref) = path.as_deref() else {
        debug!("no config location resolvable, using defaults");
        return Ok(LoadedConfig {
            config: Config::default(),
            path,
            loaded_from_file: false,
        });
    };

    if explicit.is_none() && !path_ref.exists() {
        debug!(path = %path_ref.display(), "no config file, using defaults");
        return Ok(LoadedConfig {
            config: Config::default(),
            path,
            loaded_from_file: false,
        });
    }

    let raw = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let config = Config::from_toml_str(&raw, path_ref)?;
    debug!(path = %path_ref.display(), "loaded config file");

    Ok(LoadedConfig {
        config,
        path,
        loaded_from_file: true,
    })
}

/// Resolves the default config path from the environment.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    config_path_from(
        std::env::var_os("XDG_CONFIG_HOME"),
        std::env::var_os("HOME"),
    )
}

fn config_path_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home.filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join(APP_DIR).join(CONFIG_FILE));
    }
    let home = home.filter(|v| !v.is_empty())?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILE),
    )
}

/// `HH:MM` (de)serialization for the daily schedule time.
mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de};

    const FORMAT: &str = "%H:%M";

    pub(super) fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT)
            .map_err(|_| de::Error::custom(format!("invalid schedule_time '{raw}', expected HH:MM")))
    }
}
