use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::TailError;
use crate::fingerprint::MAX_WINDOW;
use crate::sincedb::{SincedbFormat, StoreSettings};
use crate::tail::TailSettings;
use crate::watch::WatchSettings;
use crate::watched_file::FileSettings;

pub const ENV_SINCEDB_PATH: &str = "SINCEDB_PATH";
pub const ENV_MAX_OPEN_FILES: &str = "FILEWATCH_MAX_OPEN_FILES";
pub const ENV_OPEN_WARN_INTERVAL: &str = "FILEWATCH_OPEN_WARN_INTERVAL";
pub const ENV_MAX_FILES_WARN_INTERVAL: &str = "FILEWATCH_MAX_FILES_WARN_INTERVAL";

const SECONDS_PER_DAY: f64 = 24.0 * 3600.0;

/// Where a file seen at startup with no stored position starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    Beginning,
    #[default]
    End,
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginning" => Ok(Self::Beginning),
            "end" => Ok(Self::End),
            other => Err(format!("expected `beginning` or `end`, got `{other}`")),
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beginning => f.write_str("beginning"),
            Self::End => f.write_str("end"),
        }
    }
}

/// Tailing configuration, loadable from TOML.
///
/// Intervals are fractional seconds; `sincedb_clean_after` is in days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailConfig {
    #[serde(default)]
    pub sincedb_path: Option<PathBuf>,
    #[serde(default = "default_write_interval")]
    pub sincedb_write_interval: f64,
    #[serde(default = "default_clean_after_days")]
    pub sincedb_clean_after: f64,
    #[serde(default)]
    pub sincedb_format: SincedbFormat,
    #[serde(default = "default_lock_timeout")]
    pub sincedb_lock_timeout: f64,
    #[serde(default = "default_stat_interval")]
    pub stat_interval: f64,
    #[serde(default = "default_discover_interval")]
    pub discover_interval: u64,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Files last modified longer ago than this are skipped at startup.
    #[serde(default)]
    pub ignore_older: Option<f64>,
    /// Open files idle longer than this are closed.
    #[serde(default)]
    pub close_older: Option<f64>,
    #[serde(default)]
    pub max_open_files: Option<usize>,
    #[serde(default)]
    pub start_new_files_at: StartPosition,
    #[serde(default = "default_window")]
    pub read_window_size: u16,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_chunk_size")]
    pub file_chunk_size: usize,
    #[serde(default)]
    pub read_iterations: Option<u64>,
    #[serde(default)]
    pub open_warn_interval: Option<f64>,
    #[serde(default)]
    pub max_files_warn_interval: Option<f64>,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            sincedb_path: None,
            sincedb_write_interval: default_write_interval(),
            sincedb_clean_after: default_clean_after_days(),
            sincedb_format: SincedbFormat::default(),
            sincedb_lock_timeout: default_lock_timeout(),
            stat_interval: default_stat_interval(),
            discover_interval: default_discover_interval(),
            exclude: Vec::new(),
            ignore_older: None,
            close_older: None,
            max_open_files: None,
            start_new_files_at: StartPosition::default(),
            read_window_size: default_window(),
            delimiter: default_delimiter(),
            file_chunk_size: default_chunk_size(),
            read_iterations: None,
            open_warn_interval: None,
            max_files_warn_interval: None,
        }
    }
}

/// Environment values that influence configuration.
///
/// Kept separate from the process environment so resolution is a pure
/// function of its inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub sincedb_path: Option<String>,
    pub home: Option<PathBuf>,
    pub max_open_files: Option<String>,
    pub open_warn_interval: Option<String>,
    pub max_files_warn_interval: Option<String>,
}

impl EnvOverrides {
    /// Read the overrides from the current process.
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            sincedb_path: env::var(ENV_SINCEDB_PATH).ok(),
            home: dirs::home_dir(),
            max_open_files: env::var(ENV_MAX_OPEN_FILES).ok(),
            open_warn_interval: env::var(ENV_OPEN_WARN_INTERVAL).ok(),
            max_files_warn_interval: env::var(ENV_MAX_FILES_WARN_INTERVAL).ok(),
        }
    }
}

/// Fully resolved settings for every component.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub store: StoreSettings,
    pub files: FileSettings,
    pub watch: WatchSettings,
    pub tail: TailSettings,
    pub exclude: Vec<String>,
}

impl TailConfig {
    /// Check ranges that would otherwise fail deep inside the loop.
    ///
    /// # Errors
    ///
    /// Returns [`TailError::InvalidConfig`] naming the offending key.
    pub fn validate(&self) -> Result<(), TailError> {
        if self.read_window_size == 0 || self.read_window_size > MAX_WINDOW {
            return Err(invalid(
                "read_window_size",
                format!("must be between 1 and {MAX_WINDOW}, got {}", self.read_window_size),
            ));
        }
        if self.max_open_files == Some(0) {
            return Err(invalid("max_open_files", "must be at least 1".to_string()));
        }
        if self.delimiter.is_empty() {
            return Err(invalid("delimiter", "must not be empty".to_string()));
        }
        if self.file_chunk_size == 0 {
            return Err(invalid("file_chunk_size", "must be at least 1".to_string()));
        }
        if self.read_iterations == Some(0) {
            return Err(invalid("read_iterations", "must be at least 1".to_string()));
        }
        if self.discover_interval == 0 {
            return Err(invalid("discover_interval", "must be at least 1".to_string()));
        }
        for (key, value, scale) in [
            ("sincedb_write_interval", self.sincedb_write_interval, 1.0),
            ("sincedb_clean_after", self.sincedb_clean_after, SECONDS_PER_DAY),
            ("sincedb_lock_timeout", self.sincedb_lock_timeout, 1.0),
            ("stat_interval", self.stat_interval, 1.0),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(key, format!("must be a non-negative number, got {value}")));
            }
            check_duration(key, value * scale)?;
        }
        for (key, value) in [
            ("ignore_older", self.ignore_older),
            ("close_older", self.close_older),
            ("open_warn_interval", self.open_warn_interval),
            ("max_files_warn_interval", self.max_files_warn_interval),
        ] {
            // non-positive values switch these off
            if let Some(secs) = value.filter(|secs| secs.is_nan() || *secs > 0.0) {
                check_duration(key, secs)?;
            }
        }
        Ok(())
    }

    /// Validate and resolve against `env`.
    ///
    /// # Errors
    ///
    /// Returns [`TailError::InvalidConfig`] for out-of-range values and
    /// [`TailError::NoSincedbPath`] if no store path can be determined.
    pub fn resolve(&self, env: &EnvOverrides) -> Result<Settings, TailError> {
        self.validate()?;

        let path = resolve_sincedb_path(
            self.sincedb_path.as_deref(),
            env.sincedb_path.as_deref(),
            env.home.as_deref(),
        )?;
        let store = StoreSettings {
            path,
            format: self.sincedb_format,
            write_interval: seconds(self.sincedb_write_interval),
            clean_after: seconds(self.sincedb_clean_after * SECONDS_PER_DAY),
            window: self.read_window_size,
            lock_timeout: seconds(self.sincedb_lock_timeout),
        };

        let files = FileSettings {
            window: self.read_window_size,
            close_older: enabled_duration(self.close_older),
            ignore_older: enabled_duration(self.ignore_older),
        };

        let watch = WatchSettings {
            stat_interval: seconds(self.stat_interval),
            discover_interval: self.discover_interval,
            max_open_files: resolve_max_open_files(
                self.max_open_files,
                env.max_open_files.as_deref(),
            ),
            max_files_warn_interval: resolve_interval(
                self.max_files_warn_interval,
                env.max_files_warn_interval.as_deref(),
                20.0,
            ),
        };

        let tail = TailSettings {
            start_new_files_at: self.start_new_files_at,
            delimiter: self.delimiter.as_bytes().to_vec(),
            file_chunk_size: self.file_chunk_size,
            read_iterations: self.read_iterations,
            open_warn_interval: resolve_interval(
                self.open_warn_interval,
                env.open_warn_interval.as_deref(),
                300.0,
            ),
        };

        Ok(Settings {
            store,
            files,
            watch,
            tail,
            exclude: self.exclude.clone(),
        })
    }
}

/// Load a TOML config file.
///
/// # Errors
///
/// Fails if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<TailConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<TailConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Explicit path, then `$SINCEDB_PATH`, then `~/.sincedb`.
///
/// # Errors
///
/// Returns [`TailError::NoSincedbPath`] when none of the three is set.
pub fn resolve_sincedb_path(
    configured: Option<&Path>,
    env_sincedb: Option<&str>,
    home: Option<&Path>,
) -> Result<PathBuf, TailError> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = env_sincedb.filter(|p| !p.trim().is_empty()) {
        return Ok(PathBuf::from(path));
    }
    home.map(|h| h.join(".sincedb"))
        .ok_or(TailError::NoSincedbPath)
}

/// Configured value, then the environment, then 4095.
#[must_use]
pub fn resolve_max_open_files(configured: Option<usize>, env_value: Option<&str>) -> usize {
    configured
        .or_else(|| env_value.and_then(|v| v.trim().parse::<usize>().ok()))
        .filter(|n| *n > 0)
        .unwrap_or(4095)
}

/// Configured seconds, then the environment, then `default_secs`.
#[must_use]
pub fn resolve_interval(configured: Option<f64>, env_value: Option<&str>, default_secs: f64) -> Duration {
    configured
        .or_else(|| env_value.and_then(|v| v.trim().parse::<f64>().ok()))
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or_else(|| seconds(default_secs))
}

/// `None` and non-positive values disable the feature.
fn enabled_duration(value: Option<f64>) -> Option<Duration> {
    value
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn check_duration(key: &'static str, secs: f64) -> Result<(), TailError> {
    Duration::try_from_secs_f64(secs)
        .map(|_| ())
        .map_err(|_| invalid(key, format!("is too large to be a duration, got {secs} seconds")))
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn invalid(key: &'static str, reason: String) -> TailError {
    TailError::InvalidConfig { key, reason }
}

const fn default_write_interval() -> f64 {
    10.0
}

const fn default_clean_after_days() -> f64 {
    10.0
}

const fn default_lock_timeout() -> f64 {
    2.0
}

const fn default_stat_interval() -> f64 {
    1.0
}

const fn default_discover_interval() -> u64 {
    5
}

const fn default_window() -> u16 {
    MAX_WINDOW
}

fn default_delimiter() -> String {
    "\n".to_string()
}

const fn default_chunk_size() -> usize {
    32768
}
