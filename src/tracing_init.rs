//! Tracing setup.
//!
//! One `fmt` layer in the configured format, filtered by `EnvFilter`. `RUST_LOG`
//! wins over `application.log_level`; without it the configured level applies to
//! this crate and HTTP internals are held at `info` or quieter.
//!
//! Job events carry structured fields (`job_id`, `step`, `setpoint`, `measured`), so
//! the JSON format is directly usable for log aggregation.
//!
//! # Example
//! ```no_run
//! use smu_sweep::{config::AppConfig, tracing_init};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! tracing_init::init_from_config(&config)?;
//! tracing::info!(port = config.server.port, "Starting");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored; for interactive use
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            )),
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level for this crate
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Log span open/close (shows job run duration)
    pub span_events: bool,
    /// Include source file and line
    pub source_location: bool,
    /// ANSI colors for the pretty format
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            span_events: false,
            source_location: false,
            ansi: true,
        }
    }
}

impl TracingConfig {
    /// Options derived from `application.log_level` / `application.log_format`
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Self::default()
        })
    }

    /// Defaults at `level`
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Set the line format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable span open/close events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Default filter directive when `RUST_LOG` is unset
    pub fn filter_directive(&self) -> String {
        let level = level_name(self.level);
        let http = if self.level > Level::INFO { "info" } else { level };
        format!("{level},hyper={http},axum={http}")
    }
}

/// Install the global subscriber from the application configuration
pub fn init_from_config(config: &AppConfig) -> Result<(), String> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber that is already installed (tests, embedding applications) is not
/// an error.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.source_location)
        .with_line_number(config.source_location);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) if already_set(&e) => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {}", e)),
    }
}

fn already_set(e: &TryInitError) -> bool {
    e.to_string().contains("already been set")
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level).map_err(|_| {
        format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}
