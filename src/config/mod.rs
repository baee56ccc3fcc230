//! Pipeline configuration loaded from a JSON file.
//!
//! Every field has a default, so a file only needs the `sources` list.
//! Session credentials never live in the file: each source names the
//! environment variable that carries its session cookie.
//!
//! Default location:
//! 1. `$XDG_CONFIG_HOME/harvester/config.json`
//! 2. `$HOME/.config/harvester/config.json`

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::download::RetryPolicy;
use crate::download::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_CHUNK_SIZE, READ_TIMEOUT_SECS};
use crate::fetch::{FetchSettings, QueueThresholds};
use crate::pipeline::ControllerSettings;
use crate::queue::MAX_QUEUE_CAPACITY;
use crate::resource::DiskFloor;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("could not read config {path}: {source}")]
    Io {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for [`PipelineConfig`].
    #[error("could not parse config {path}: {source}")]
    Parse {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[error("invalid config value for `{field}`: {message}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Neither `XDG_CONFIG_HOME` nor `HOME` is set.
    #[error("no config path: set XDG_CONFIG_HOME or HOME, or pass --config")]
    NoDefaultPath,
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// One service of a source and the storage label it is filed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service key used in API paths, e.g. `patreon`.
    pub name: String,
    /// Directory label under the storage roots, e.g. `Patreon`.
    pub directory: String,
}

/// A creator listed explicitly in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorConfig {
    /// Service key.
    pub service: String,
    /// Creator identifier.
    pub id: String,
    /// Display name; defaults to the identifier.
    #[serde(default)]
    pub name: Option<String>,
}

/// A content-hosting API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Short name used in logs.
    pub name: String,
    /// API root, e.g. `https://host.example/api/v1`.
    pub base_url: String,
    /// Prefix joined with file paths to build download URLs.
    pub file_url: String,
    /// Environment variable holding the session cookie.
    #[serde(default)]
    pub session_env: Option<String>,
    /// Services fetched from this source.
    pub services: Vec<ServiceConfig>,
    /// Creators fetched in addition to the account's favorites.
    #[serde(default)]
    pub creators: Vec<CreatorConfig>,
    /// Whether to list the account's favorites.
    #[serde(default = "default_true")]
    pub favorites: bool,
}

impl SourceConfig {
    /// Storage label of `service`, if the service is configured.
    #[must_use]
    pub fn directory(&self, service: &str) -> Option<&str> {
        self.services
            .iter()
            .find(|s| s.name == service)
            .map(|s| s.directory.as_str())
    }

    /// Reads the session credential from the environment.
    #[must_use]
    pub fn session(&self) -> Option<String> {
        let var = self.session_env.as_deref()?;
        env::var(var).ok().filter(|value| !value.is_empty())
    }
}

/// Remote-sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether sync runs at all.
    pub enabled: bool,
    /// Path or name of the `rclone` binary.
    pub binary: PathBuf,
    /// Remote name, e.g. `gdrive:`.
    pub remote: String,
    /// Local final-storage size that triggers a move.
    pub threshold_bytes: u64,
    /// Seconds between size checks.
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: PathBuf::from("rclone"),
            remote: String::new(),
            threshold_bytes: 50_000_000_000,
            poll_interval_secs: 60,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of published files.
    pub final_root: PathBuf,
    /// Root of in-flight files; must share a volume with `final_root`.
    pub scratch_root: PathBuf,
    /// Persisted fingerprint cache.
    pub hash_cache: PathBuf,
    /// Bounded queue capacity.
    pub queue_capacity: usize,
    /// Resume fraction of capacity.
    pub queue_low_threshold: f64,
    /// Pause fraction of capacity.
    pub queue_high_threshold: f64,
    /// Records requested per listing page.
    pub page_size: usize,
    /// A page with fewer new items ends a creator's pagination.
    pub min_new_per_page: usize,
    /// Write-buffer size for transfers.
    pub chunk_size: usize,
    /// Lower bound of the worker pool.
    pub min_workers: usize,
    /// Starting worker count.
    pub initial_workers: usize,
    /// Upper bound of the worker pool.
    pub max_workers: usize,
    /// Creators paginated at once.
    pub producer_concurrency: usize,
    /// Absolute free-space floor.
    pub min_free_bytes: u64,
    /// Free-space floor as a fraction of the starting free space.
    pub min_free_fraction: f64,
    /// Milliseconds between disk checks.
    pub guard_interval_ms: u64,
    /// Completed-file sizes kept by the controller.
    pub controller_window: usize,
    /// Samples required before the controller acts.
    pub controller_min_samples: usize,
    /// Seconds between controller evaluations.
    pub controller_interval_secs: u64,
    /// Minimum worker-count change the controller applies.
    pub controller_hysteresis: usize,
    /// Attempts per request, including the first.
    pub max_attempts: u32,
    /// First retry delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Cap of the exponential delay in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Upper bound of the random jitter in milliseconds.
    pub retry_max_jitter_ms: u64,
    /// Minimum spacing between listing requests to one host.
    pub api_spacing_ms: u64,
    /// HTTP connect timeout.
    pub connect_timeout_secs: u64,
    /// HTTP request timeout.
    pub request_timeout_secs: u64,
    /// Rebuild the fingerprint set from storage instead of the cache.
    pub reconcile: bool,
    /// Remote sync.
    pub sync: SyncConfig,
    /// Sources to fetch.
    pub sources: Vec<SourceConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            final_root: PathBuf::from("Data/Files"),
            scratch_root: PathBuf::from("Data/Temp"),
            hash_cache: PathBuf::from("Data/hashes.json"),
            queue_capacity: 2500,
            queue_low_threshold: 0.2,
            queue_high_threshold: 0.8,
            page_size: 50,
            min_new_per_page: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_workers: 1,
            initial_workers: 8,
            max_workers: 32,
            producer_concurrency: 4,
            min_free_bytes: 5_000_000_000,
            min_free_fraction: 0.1,
            guard_interval_ms: 10_000,
            controller_window: 100,
            controller_min_samples: 20,
            controller_interval_secs: 30,
            controller_hysteresis: 2,
            max_attempts: 5,
            retry_base_delay_ms: 4_000,
            retry_max_delay_ms: 10_000,
            retry_max_jitter_ms: 2_000,
            api_spacing_ms: 500,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            request_timeout_secs: READ_TIMEOUT_SECS,
            reconcile: false,
            sync: SyncConfig::default(),
            sources: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    /// Reads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), sources = config.sources.len(), "config loaded");
        Ok(config)
    }

    /// Checks ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::invalid(
                "queue_capacity",
                format!("{} is outside 1..={MAX_QUEUE_CAPACITY}", self.queue_capacity),
            ));
        }
        let (low, high) = (self.queue_low_threshold, self.queue_high_threshold);
        if !(low > 0.0 && low <= 1.0) {
            return Err(ConfigError::invalid("queue_low_threshold", format!("{low} is outside (0, 1]")));
        }
        if !(high > 0.0 && high <= 1.0) {
            return Err(ConfigError::invalid("queue_high_threshold", format!("{high} is outside (0, 1]")));
        }
        if low >= high {
            return Err(ConfigError::invalid(
                "queue_low_threshold",
                format!("{low} must be below queue_high_threshold {high}"),
            ));
        }
        if self.page_size == 0 {
            return Err(ConfigError::invalid("page_size", "must be at least 1"));
        }
        if self.min_workers == 0 {
            return Err(ConfigError::invalid("min_workers", "must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::invalid(
                "min_workers",
                format!("{} exceeds max_workers {}", self.min_workers, self.max_workers),
            ));
        }
        if self.max_workers > 100 {
            return Err(ConfigError::invalid("max_workers", "must be at most 100"));
        }
        if !(0.0..=1.0).contains(&self.min_free_fraction) {
            return Err(ConfigError::invalid(
                "min_free_fraction",
                format!("{} is outside [0, 1]", self.min_free_fraction),
            ));
        }
        if self.producer_concurrency == 0 {
            return Err(ConfigError::invalid("producer_concurrency", "must be at least 1"));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::invalid("sources", "at least one source is required"));
        }
        for source in &self.sources {
            if source.services.is_empty() {
                return Err(ConfigError::invalid(
                    "services",
                    format!("source `{}` lists no services", source.name),
                ));
            }
        }
        if self.sync.enabled && self.sync.remote.is_empty() {
            return Err(ConfigError::invalid("sync.remote", "required when sync is enabled"));
        }
        Ok(())
    }

    /// Starting worker count clamped into the pool bounds.
    #[must_use]
    pub fn clamped_initial_workers(&self) -> usize {
        self.initial_workers.clamp(self.min_workers, self.max_workers)
    }

    /// Queue thresholds.
    #[must_use]
    pub fn thresholds(&self) -> QueueThresholds {
        QueueThresholds {
            low: self.queue_low_threshold,
            high: self.queue_high_threshold,
        }
    }

    /// Producer settings.
    #[must_use]
    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            page_size: self.page_size,
            min_new_per_page: self.min_new_per_page,
            thresholds: self.thresholds(),
        }
    }

    /// Retry policy shared by listing requests and transfers.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            2.0,
        )
        .with_max_jitter(Duration::from_millis(self.retry_max_jitter_ms))
    }

    /// Disk floor.
    #[must_use]
    pub fn disk_floor(&self) -> DiskFloor {
        DiskFloor {
            min_free_bytes: self.min_free_bytes,
            min_free_fraction: self.min_free_fraction,
        }
    }

    /// Concurrency controller settings.
    #[must_use]
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            min_samples: self.controller_min_samples,
            interval: Duration::from_secs(self.controller_interval_secs.max(1)),
            hysteresis: self.controller_hysteresis,
            min_workers: self.min_workers,
            max_workers: self.max_workers,
        }
    }
}

/// Resolves the default config path.
///
/// # Errors
///
/// Returns [`ConfigError::NoDefaultPath`] when neither variable is set.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("harvester").join("config.json"));
    }
    let home = env_var_non_empty_os("HOME").ok_or(ConfigError::NoDefaultPath)?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("harvester")
        .join("config.json"))
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
