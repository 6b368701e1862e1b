//! Configuration System using Figment
//!
//! Settings are layered from:
//! 1. built-in defaults
//! 2. a TOML file (`config/scan_daq.toml` unless another path is given)
//! 3. environment variables prefixed with `SCAN_DAQ_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use scan_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Application: {}", settings.application.name);
//! # Ok::<(), scan_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/scan_daq.toml";

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Experiment orchestration and persistence
    #[serde(default)]
    pub experiment: ExperimentConfig,
    /// Axis polling behaviour
    #[serde(default)]
    pub axis: AxisConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Operator name recorded with every run
    #[serde(default = "default_user")]
    pub user: String,
    /// Session label recorded with every run
    #[serde(default = "default_session")]
    pub session_name: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            user: default_user(),
            session_name: default_session(),
        }
    }
}

/// Experiment orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Persist runs on the orchestrator task instead of a blocking worker
    #[serde(default)]
    pub save_on_main: bool,
    /// Base directory for run data
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    /// Run directory template, relative to `data_directory`
    #[serde(default = "default_save_format")]
    pub save_format: String,
    /// Directory for application state at rest
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,
    /// Sleep between Idle/Paused ticks in milliseconds
    #[serde(default = "default_idle_tick")]
    pub idle_tick_ms: u64,
    /// Start the queue as soon as the experiment is idle
    #[serde(default)]
    pub auto_start: bool,
    /// Shut down once the queue has drained
    #[serde(default)]
    pub exit_after_finish: bool,
    /// Skip persistence entirely
    #[serde(default)]
    pub discard_data: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            save_on_main: false,
            data_directory: default_data_directory(),
            save_format: default_save_format(),
            state_directory: default_state_directory(),
            idle_tick_ms: default_idle_tick(),
            auto_start: false,
            exit_after_finish: false,
            discard_data: false,
        }
    }
}

impl ExperimentConfig {
    /// Idle/Paused tick as a duration.
    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }
}

/// Polling backoff for proxied axes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// First poll interval in milliseconds
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    /// Growth factor between polls
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Largest poll interval in milliseconds
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_ms: u64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_ceiling_ms: default_backoff_ceiling(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "scan_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_user() -> String {
    "global".to_string()
}

fn default_session() -> String {
    "default".to_string()
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_save_format() -> String {
    "{user}/{session}/{run}".to_string()
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("state")
}

fn default_idle_tick() -> u64 {
    100
}

fn default_backoff_initial() -> u64 {
    30
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_backoff_ceiling() -> u64 {
    200
}

impl Settings {
    /// Load from the default config path and environment variables
    ///
    /// Environment variables override file values, e.g.
    /// `SCAN_DAQ_APPLICATION__LOG_LEVEL=debug`.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path. A missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCAN_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.experiment.idle_tick_ms == 0 {
            return Err(DaqError::Configuration(
                "idle_tick_ms must be greater than 0".to_string(),
            ));
        }

        if self.axis.backoff_initial_ms == 0 || self.axis.backoff_multiplier < 1.0 {
            return Err(DaqError::Configuration(format!(
                "Backoff must start above 0ms and grow by at least 1.0 (got {}ms, x{})",
                self.axis.backoff_initial_ms, self.axis.backoff_multiplier
            )));
        }

        if self.axis.backoff_ceiling_ms < self.axis.backoff_initial_ms {
            return Err(DaqError::Configuration(format!(
                "backoff_ceiling_ms ({}) is below backoff_initial_ms ({})",
                self.axis.backoff_ceiling_ms, self.axis.backoff_initial_ms
            )));
        }

        let probe: HashMap<String, String> = ["user", "session", "run", "date", "time"]
            .into_iter()
            .map(|k| (k.to_string(), "x".to_string()))
            .collect();
        strfmt::strfmt(&self.experiment.save_format, &probe).map_err(|e| {
            DaqError::Configuration(format!(
                "save_format '{}' does not render: {}",
                self.experiment.save_format, e
            ))
        })?;

        Ok(())
    }
}
