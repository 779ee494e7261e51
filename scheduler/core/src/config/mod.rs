//! TOML Configuration File Support
//!
//! Configuration of the scheduler: which backends exist, how many engine
//! connections each one gets, and how long a call may take. Loaded from
//! `~/.config/engine-scheduler/scheduler.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. Overrides from the embedding application ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/engine-scheduler/scheduler.toml`
//!   (typically `~/.config/engine-scheduler/scheduler.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [scheduler]
//! response_deadline_ms = 20000
//! default_pool_size = 3
//!
//! [backends.reveaal]
//! pool_size = 4
//! supports_ignored_io = true
//!
//! [backends.j-ecdar]
//! pool_size = 1
//! deadline_ms = 60000
//! ```
//!
//! # Environment Variables
//!
//! - `ENGINE_SCHEDULER_DEADLINE_MS`: default RPC deadline
//! - `ENGINE_SCHEDULER_POOL_SIZE`: pool size for backends without `pool_size`

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default RPC deadline
pub const DEFAULT_RESPONSE_DEADLINE_MS: u64 = 20_000;

/// Default number of connections per backend
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Largest accepted pool size
pub const MAX_POOL_SIZE: usize = 64;

const ENV_DEADLINE_MS: &str = "ENGINE_SCHEDULER_DEADLINE_MS";
const ENV_POOL_SIZE: &str = "ENGINE_SCHEDULER_POOL_SIZE";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value set by the embedding application
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[scheduler]` section
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Default RPC deadline in milliseconds
    pub response_deadline_ms: Option<u64>,
    /// Pool size for backends that omit `pool_size`
    pub default_pool_size: Option<usize>,
}

/// `[backends.<name>]` section
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Number of engine connections
    pub pool_size: Option<usize>,
    /// Whether queries may carry ignored inputs/outputs
    pub supports_ignored_io: Option<bool>,
    /// Deadline override in milliseconds
    pub deadline_ms: Option<u64>,
}

/// Root of the TOML file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerToml {
    /// Global scheduler settings
    pub scheduler: SchedulerSection,
    /// Per-backend settings, keyed by backend name
    pub backends: BTreeMap<String, BackendToml>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Settings of one backend
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendSettings {
    /// Number of engine connections; `None` uses the default pool size
    pub pool_size: Option<usize>,
    /// Whether queries sent to this backend carry ignored inputs/outputs
    pub supports_ignored_io: bool,
    /// Deadline override; `None` uses the default deadline
    pub deadline: Option<Duration>,
}

impl BackendSettings {
    /// Settings with a fixed pool size
    #[must_use]
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size: Some(pool_size),
            ..Self::default()
        }
    }
}

/// Resolved scheduler configuration
///
/// Use [`load_config`] to load configuration with proper priority handling,
/// or build one in code with [`SchedulerConfig::with_backend`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Deadline of a call, measured from dispatch
    pub response_deadline: Duration,

    /// Pool size for backends without their own
    pub default_pool_size: usize,

    /// Configured backends
    pub backends: BTreeMap<String, BackendSettings>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            response_deadline: Duration::from_millis(DEFAULT_RESPONSE_DEADLINE_MS),
            default_pool_size: DEFAULT_POOL_SIZE,
            backends: BTreeMap::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a backend with `pool_size` connections
    #[must_use]
    pub fn with_backend(self, name: impl Into<String>, pool_size: usize) -> Self {
        self.with_backend_settings(name, BackendSettings::with_pool_size(pool_size))
    }

    /// Add (or replace) a backend with explicit settings
    #[must_use]
    pub fn with_backend_settings(mut self, name: impl Into<String>, settings: BackendSettings) -> Self {
        self.backends.insert(name.into(), settings);
        self
    }

    /// Set the default deadline
    #[must_use]
    pub fn with_response_deadline(mut self, deadline: Duration) -> Self {
        self.response_deadline = deadline;
        self
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Effective pool size of `backend`
    #[must_use]
    pub fn pool_size(&self, backend: &BackendSettings) -> usize {
        backend.pool_size.unwrap_or(self.default_pool_size)
    }

    /// Effective deadline of `backend`
    #[must_use]
    pub fn deadline(&self, backend: &BackendSettings) -> Duration {
        backend.deadline.unwrap_or(self.response_deadline)
    }

    /// Check pool sizes and deadlines
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a pool size outside
    /// `1..=64` or a zero deadline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_pool_size("default_pool_size", self.default_pool_size)?;
        check_deadline("response_deadline_ms", self.response_deadline)?;
        for (name, backend) in &self.backends {
            check_pool_size(&format!("backends.{name}.pool_size"), self.pool_size(backend))?;
            check_deadline(&format!("backends.{name}.deadline_ms"), self.deadline(backend))?;
        }
        Ok(())
    }
}

fn check_pool_size(key: &str, size: usize) -> Result<(), ConfigError> {
    if (1..=MAX_POOL_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{key} must be between 1 and {MAX_POOL_SIZE}, got {size}"
        )))
    }
}

fn check_deadline(key: &str, deadline: Duration) -> Result<(), ConfigError> {
    if deadline.is_zero() {
        Err(ConfigError::ValidationError(format!("{key} must be greater than 0")))
    } else {
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/engine-scheduler/scheduler.toml` or
/// `~/.config/engine-scheduler/scheduler.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("engine-scheduler").join("scheduler.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// resulting values are invalid. A missing config file is not an error.
pub fn load_config() -> Result<SchedulerConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// If `path` is `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the resulting values are invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SchedulerConfig, ConfigError> {
    let mut config = SchedulerConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SchedulerToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                backends = config.backends.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut SchedulerConfig, toml: &SchedulerToml) {
    if let Some(ms) = toml.scheduler.response_deadline_ms {
        config.response_deadline = Duration::from_millis(ms);
    }
    if let Some(size) = toml.scheduler.default_pool_size {
        config.default_pool_size = size;
    }
    for (name, backend) in &toml.backends {
        config.backends.insert(
            name.clone(),
            BackendSettings {
                pool_size: backend.pool_size,
                supports_ignored_io: backend.supports_ignored_io.unwrap_or(false),
                deadline: backend.deadline_ms.map(Duration::from_millis),
            },
        );
    }
}

/// Apply environment variable overrides to the config
///
/// `lookup` resolves a variable name; unparsable values are ignored.
fn apply_env_config(config: &mut SchedulerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(value) = lookup(ENV_DEADLINE_MS) {
        match value.trim().parse::<u64>() {
            Ok(ms) => {
                config.response_deadline = Duration::from_millis(ms);
                config.source = ConfigSource::Env;
            }
            Err(_) => tracing::warn!(var = ENV_DEADLINE_MS, %value, "Ignoring unparsable value"),
        }
    }
    if let Some(value) = lookup(ENV_POOL_SIZE) {
        match value.trim().parse::<usize>() {
            Ok(size) => {
                config.default_pool_size = size;
                config.source = ConfigSource::Env;
            }
            Err(_) => tracing::warn!(var = ENV_POOL_SIZE, %value, "Ignoring unparsable value"),
        }
    }
}

// =============================================================================
// Override Support
// =============================================================================

/// Overrides set by the embedding application
///
/// Use this after [`load_config`]; overrides win over every other source.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Default deadline override (milliseconds)
    pub response_deadline_ms: Option<u64>,

    /// Default pool size override
    pub default_pool_size: Option<usize>,

    /// Per-backend pool size overrides
    pub backend_pool_sizes: BTreeMap<String, usize>,
}

impl ConfigOverrides {
    /// Create empty overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the default deadline
    #[must_use]
    pub fn with_response_deadline_ms(mut self, ms: u64) -> Self {
        self.response_deadline_ms = Some(ms);
        self
    }

    /// Override the default pool size
    #[must_use]
    pub fn with_default_pool_size(mut self, size: usize) -> Self {
        self.default_pool_size = Some(size);
        self
    }

    /// Override the pool size of one backend, adding the backend if needed
    #[must_use]
    pub fn with_backend_pool_size(mut self, backend: impl Into<String>, size: usize) -> Self {
        self.backend_pool_sizes.insert(backend.into(), size);
        self
    }

    /// Whether no override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.response_deadline_ms.is_none()
            && self.default_pool_size.is_none()
            && self.backend_pool_sizes.is_empty()
    }

    /// Apply the overrides to `config`
    pub fn apply(&self, config: &mut SchedulerConfig) {
        if self.is_empty() {
            return;
        }
        if let Some(ms) = self.response_deadline_ms {
            config.response_deadline = Duration::from_millis(ms);
        }
        if let Some(size) = self.default_pool_size {
            config.default_pool_size = size;
        }
        for (name, size) in &self.backend_pool_sizes {
            config.backends.entry(name.clone()).or_default().pool_size = Some(*size);
        }
        config.source = ConfigSource::Cli;
    }
}

// =============================================================================
// Tests
// =============================================================================
