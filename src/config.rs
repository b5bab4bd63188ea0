//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the sweep server.
//! Configuration is loaded from:
//! 1. `config/smu_sweep.toml` (base configuration, optional)
//! 2. Environment variables (prefixed with `SMU_SWEEP_`, sections split on `__`)
//!
//! Every section carries serde defaults, so a missing file still yields a runnable
//! configuration that talks to the mock backend.
//!
//! # Example
//! ```no_run
//! use smu_sweep::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Listening on {}:{}", config.server.host, config.server.port);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, SweepError};
use crate::experiment::job::MAX_ITERATION_COUNT;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/smu_sweep.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// HTTP / WebSocket listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Instrument backend selection
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Defaults applied to inbound job commands
    #[serde(default)]
    pub job: JobConfig,
    /// Results log settings
    #[serde(default)]
    pub storage: StorageConfig,
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
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Which source-measure backend new jobs open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentBackend {
    /// Simulated instrument, no hardware required
    Mock,
    /// Keithley 2400 over a serial line (feature `serial`)
    Keithley2400,
}

/// Instrument backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Backend used by `start` commands
    #[serde(default = "default_backend")]
    pub backend: InstrumentBackend,
    /// Serial baud rate for hardware backends
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Job defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Wall-clock bound on a job when the command omits `timeoutMinutes`
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u64,
    /// Settle delay between steps when the command omits `interStepDelayMs`
    #[serde(default = "default_inter_step_delay_ms")]
    pub default_inter_step_delay_ms: u64,
    /// Largest sweep (or replay list) a command may request
    #[serde(default = "default_max_iteration_count")]
    pub max_iteration_count: usize,
}

/// Results log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Write a results file after every job
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Output directory for results files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// Default value functions
fn default_name() -> String {
    "smu-sweep".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_backend() -> InstrumentBackend {
    InstrumentBackend::Mock
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_minutes() -> u64 {
    20
}

fn default_inter_step_delay_ms() -> u64 {
    100
}

fn default_max_iteration_count() -> usize {
    MAX_ITERATION_COUNT
}

fn default_enabled() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: default_timeout_minutes(),
            default_inter_step_delay_ms: default_inter_step_delay_ms(),
            max_iteration_count: default_max_iteration_count(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            output_dir: default_output_dir(),
        }
    }
}

impl JobConfig {
    /// Default job timeout as a `Duration`.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_minutes.saturating_mul(60))
    }

    /// Default settle delay as a `Duration`.
    pub fn default_inter_step_delay(&self) -> Duration {
        Duration::from_millis(self.default_inter_step_delay_ms)
    }

    /// Reject sweeps longer than `max_iteration_count` points.
    ///
    /// # Errors
    /// `SweepError::Validation` naming the requested count and the cap.
    pub fn check_iteration_count(&self, count: usize) -> AppResult<()> {
        if count > self.max_iteration_count {
            return Err(SweepError::Validation(format!(
                "iterationCount {} exceeds the maximum of {}",
                count, self.max_iteration_count
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `SMU_SWEEP_`.
    /// Example: `SMU_SWEEP_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SMU_SWEEP_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.server.port == 0 {
            return Err("Invalid server port 0".to_string());
        }

        if self.job.default_timeout_minutes == 0 {
            return Err("job.default_timeout_minutes must be at least 1".to_string());
        }

        if !(1..=MAX_ITERATION_COUNT).contains(&self.job.max_iteration_count) {
            return Err(format!(
                "job.max_iteration_count must be between 1 and {}",
                MAX_ITERATION_COUNT
            ));
        }

        if self.instrument.baud_rate == 0 {
            return Err("instrument.baud_rate must be positive".to_string());
        }

        Ok(())
    }
}
