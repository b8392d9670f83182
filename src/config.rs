//! Testbench configuration.
//!
//! Settings are loaded with `figment` from a TOML file, then overridden by
//! environment variables prefixed with `TESTBENCH_`. Nested keys are separated
//! by a double underscore so field names keep their own underscores:
//! `TESTBENCH_APPLICATION__LOG_LEVEL=debug`.
//!
//! Apparatus and experiment descriptions live in their own files; see
//! [`apparatus`] and [`experiment`].
//!
//! # Example
//! ```no_run
//! use testbench::config::TestbenchConfig;
//!
//! let config = TestbenchConfig::load_from("config/testbench.toml")?;
//! println!("Logs go to {}", config.storage.log_dir.display());
//! # Ok::<(), testbench::error::TestbenchError>(())
//! ```

pub mod apparatus;
pub mod experiment;

use crate::error::{AppResult, TestbenchError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/testbench.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "TESTBENCH_";

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestbenchConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where run files and archives go
    #[serde(default)]
    pub storage: StorageConfig,
    /// Recorder capacities
    #[serde(default)]
    pub recording: RecordingSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-run recording directories
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Where finished runs are archived
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
}

/// Recorder capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSettings {
    /// Samples kept by each instrument's rolling display buffer
    #[serde(default = "default_rolling_samples")]
    pub rolling_samples: usize,
    /// Retention target of named recordings before they are halved
    #[serde(default = "default_stored_samples")]
    pub stored_samples: usize,
}

// Default value functions
fn default_name() -> String {
    "Testbench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("testbench")
}

fn default_log_dir() -> PathBuf {
    data_root().join("logs")
}

fn default_archive_dir() -> PathBuf {
    data_root().join("archives")
}

fn default_rolling_samples() -> usize {
    500
}

fn default_stored_samples() -> usize {
    1000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            archive_dir: default_archive_dir(),
        }
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            rolling_samples: default_rolling_samples(),
            stored_samples: default_stored_samples(),
        }
    }
}

impl TestbenchConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error: defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate().map_err(TestbenchError::Configuration)?;
        Ok(config)
    }

    /// The layered provider: defaults, then the file, then the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(TestbenchConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        if self.recording.rolling_samples == 0 {
            return Err("recording.rolling_samples must be at least 1".to_string());
        }
        if self.recording.stored_samples == 0 {
            return Err("recording.stored_samples must be at least 1".to_string());
        }
        if self.storage.log_dir.as_os_str().is_empty() {
            return Err("storage.log_dir is empty".to_string());
        }
        Ok(())
    }
}
