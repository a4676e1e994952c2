//! Configuration management.
//!
//! # Example TOML
//!
//! ```toml
//! [dedup]
//! similarity_threshold_fuzzy = 0.85
//! similarity_threshold_semantic = 0.95
//! auto_merge_threshold = 0.9
//! batch_size = 100
//! enabled_detectors = ["exact", "fuzzy", "semantic"]
//! merge_strategy = "keep_newest"
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 100
//!
//! [logging]
//! format = "json"
//! filter = "memdedup=debug"
//! ```

mod settings;

pub use settings::{
    DEFAULT_AUTO_MERGE_THRESHOLD, DEFAULT_BATCH_SIZE, DEFAULT_DETECTOR_TIMEOUT_MS,
    DEFAULT_FUZZY_THRESHOLD, DEFAULT_MAX_RECORDS_PER_RUN, DEFAULT_SEMANTIC_THRESHOLD,
    DEFAULT_SEMANTIC_TOP_K, DedupSettings, DedupSettingsBuilder, MergeStrategy, parse_detectors,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::observability::LogFormat;
use crate::services::deduplication::RetryPolicy;
use crate::{Error, Result};

/// Logging section of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Output format.
    pub format: LogFormat,
    /// Filter directive (`RUST_LOG` syntax).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Optional log file; stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Deduplication settings.
    pub dedup: DedupSettingsBuilder,
    /// Repository retry policy.
    pub retry: RetryPolicy,
    /// Logging.
    pub logging: LoggingSettings,
}

/// Effective engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Validated deduplication settings.
    pub settings: DedupSettings,
    /// Repository retry policy.
    pub retry: RetryPolicy,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the configuration from defaults and environment overrides only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the overrides are invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_config_file(ConfigFile::default())
    }

    /// Loads configuration from a file path, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the values
    /// fail validation.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;

        let file: ConfigFile = toml::from_str(&contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })?;

        Self::from_config_file(file)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir (`~/Library/Application Support/memdedup/` on macOS)
    /// 2. XDG config dir (`~/.config/memdedup/` for Unix compatibility)
    ///
    /// Falls back to defaults plus environment overrides if no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but is invalid.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from_file(&path),
            None => Self::from_env(),
        }
    }

    /// Returns the first existing default config path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        let base_dirs = directories::BaseDirs::new()?;
        let platform_config = base_dirs.config_dir().join("memdedup").join("config.toml");
        if platform_config.exists() {
            return Some(platform_config);
        }
        let xdg_config = base_dirs
            .home_dir()
            .join(".config")
            .join("memdedup")
            .join("config.toml");
        xdg_config.exists().then_some(xdg_config)
    }

    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let settings = file.dedup.with_env_overrides().build()?;
        let retry = file.retry.with_env_overrides();
        Ok(Self {
            settings,
            retry,
            logging: file.logging,
        })
    }

    /// Renders the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        let file = ConfigFile {
            dedup: self.settings.to_builder(),
            retry: self.retry.clone(),
            logging: self.logging.clone(),
        };
        toml::to_string_pretty(&file).map_err(|e| Error::OperationFailed {
            operation: "serialize_config".to_string(),
            cause: e.to_string(),
        })
    }
}
