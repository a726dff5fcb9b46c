//! Configuration module for objsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::ignore::DEFAULT_IGNORED;
use crate::domain::Permissions;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for objsync.
///
/// Every section is optional in the YAML file; missing sections take their
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub permissions: Permissions,
    pub watcher: WatcherConfig,
    pub fingerprint: FingerprintConfig,
    pub s3: S3Config,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local directory mirrored to the bucket. `~` is expanded at runtime.
    pub root: PathBuf,
    /// Maximum concurrent downloads during a reconciliation pass.
    pub download_concurrency: usize,
    /// Run a full reconciliation once the initial directory scan completes.
    pub initial_sync: bool,
    /// Path components excluded from synchronization in both directions.
    pub ignore: Vec<String>,
}

/// Local watch source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Milliseconds a file must stay unchanged before its event is released.
    pub stability_ms: u64,
    /// Milliseconds between checks of the debounce queue.
    pub poll_interval_ms: u64,
}

/// Content fingerprint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Attempts made when a file is busy/locked.
    pub retry_attempts: u32,
    /// Linear back-off step in seconds (delay = attempt * step).
    pub retry_step_secs: u64,
}

/// S3 / MinIO connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Endpoint URL including scheme, e.g. `http://127.0.0.1:9000`.
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Poll the bucket for remote changes.
    pub listen_updates: bool,
    /// Seconds between remote listing polls.
    pub poll_interval_secs: u64,
    /// Files larger than this many bytes are not uploaded. `None` disables the limit.
    pub max_file_size: Option<u64>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/objsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("objsync")
            .join("config.yaml")
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(stripped) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/ObjSync"),
            download_concurrency: 8,
            initial_sync: true,
            ignore: DEFAULT_IGNORED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stability_ms: 5000,
            poll_interval_ms: 500,
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_step_secs: 5,
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9000".to_string(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: "objsync".to_string(),
            listen_updates: true,
            poll_interval_secs: 10,
            max_file_size: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"s3.bucket"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// S3 bucket naming: 3-63 chars of lowercase letters, digits, `.` and `-`,
/// starting and ending with a letter or digit.
fn is_valid_bucket_name(name: &str) -> bool {
    let len_ok = (3..=63).contains(&name.len());
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    let edges_ok = name
        .chars()
        .next()
        .zip(name.chars().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);
    len_ok && chars_ok && edges_ok
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        let root_str = self.sync.root.to_string_lossy();
        if root_str.is_empty() {
            errors.push(ValidationError::new("sync.root", "must not be empty"));
        } else if !root_str.starts_with('~') && !self.sync.root.is_absolute() {
            errors.push(ValidationError::new(
                "sync.root",
                "must be an absolute path or start with ~",
            ));
        } else if self.sync.root.exists() && !self.sync.root.is_dir() {
            // A missing root is created at startup
            errors.push(ValidationError::new(
                "sync.root",
                format!("not a directory: {}", self.sync.root.display()),
            ));
        }
        if self.sync.download_concurrency == 0 {
            errors.push(ValidationError::new(
                "sync.download_concurrency",
                "must be greater than 0",
            ));
        }
        if self.sync.ignore.iter().any(|n| n.is_empty() || n.contains('/')) {
            errors.push(ValidationError::new(
                "sync.ignore",
                "entries must be single, non-empty path components",
            ));
        }

        // --- permissions ---
        if !self.permissions.read && !self.permissions.write {
            errors.push(ValidationError::new(
                "permissions",
                "at least one of read or write must be enabled",
            ));
        }

        // --- watcher ---
        if self.watcher.stability_ms == 0 {
            errors.push(ValidationError::new(
                "watcher.stability_ms",
                "must be greater than 0",
            ));
        }
        if self.watcher.poll_interval_ms == 0 {
            errors.push(ValidationError::new(
                "watcher.poll_interval_ms",
                "must be greater than 0",
            ));
        }

        // --- fingerprint ---
        if self.fingerprint.retry_attempts == 0 {
            errors.push(ValidationError::new(
                "fingerprint.retry_attempts",
                "must be greater than 0",
            ));
        }

        // --- s3 ---
        if !(self.s3.endpoint.starts_with("http://") || self.s3.endpoint.starts_with("https://"))
        {
            errors.push(ValidationError::new(
                "s3.endpoint",
                format!("must start with http:// or https://, got '{}'", self.s3.endpoint),
            ));
        }
        if self.s3.region.is_empty() {
            errors.push(ValidationError::new("s3.region", "must not be empty"));
        }
        if !is_valid_bucket_name(&self.s3.bucket) {
            errors.push(ValidationError::new(
                "s3.bucket",
                format!("invalid bucket name '{}'", self.s3.bucket),
            ));
        }
        if self.s3.access_key.is_empty() != self.s3.secret_key.is_empty() {
            errors.push(ValidationError::new(
                "s3.secret_key",
                "access_key and secret_key must be set together",
            ));
        }
        if self.s3.listen_updates && self.s3.poll_interval_secs == 0 {
            errors.push(ValidationError::new(
                "s3.poll_interval_secs",
                "must be greater than 0 when listen_updates is enabled",
            ));
        }
        if self.s3.max_file_size == Some(0) {
            errors.push(ValidationError::new(
                "s3.max_file_size",
                "must be greater than 0 when set",
            ));
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError::new(
                "logging.level",
                format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            ));
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and overrides individual fields.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start with the default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_download_concurrency(mut self, n: usize) -> Self {
        self.config.sync.download_concurrency = n;
        self
    }

    pub fn sync_initial_sync(mut self, enabled: bool) -> Self {
        self.config.sync.initial_sync = enabled;
        self
    }

    pub fn sync_ignore(mut self, names: Vec<String>) -> Self {
        self.config.sync.ignore = names;
        self
    }

    // --- permissions ---

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.config.permissions = permissions;
        self
    }

    // --- watcher ---

    pub fn watcher_stability_ms(mut self, ms: u64) -> Self {
        self.config.watcher.stability_ms = ms;
        self
    }

    pub fn watcher_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.watcher.poll_interval_ms = ms;
        self
    }

    // --- fingerprint ---

    pub fn fingerprint_retry(mut self, attempts: u32, step_secs: u64) -> Self {
        self.config.fingerprint.retry_attempts = attempts;
        self.config.fingerprint.retry_step_secs = step_secs;
        self
    }

    // --- s3 ---

    pub fn s3_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.s3.endpoint = endpoint.into();
        self
    }

    pub fn s3_region(mut self, region: impl Into<String>) -> Self {
        self.config.s3.region = region.into();
        self
    }

    pub fn s3_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.config.s3.access_key = access_key.into();
        self.config.s3.secret_key = secret_key.into();
        self
    }

    pub fn s3_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.s3.bucket = bucket.into();
        self
    }

    pub fn s3_listen_updates(mut self, enabled: bool) -> Self {
        self.config.s3.listen_updates = enabled;
        self
    }

    pub fn s3_poll_interval_secs(mut self, seconds: u64) -> Self {
        self.config.s3.poll_interval_secs = seconds;
        self
    }

    pub fn s3_max_file_size(mut self, bytes: Option<u64>) -> Self {
        self.config.s3.max_file_size = bytes;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
