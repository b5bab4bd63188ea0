//! Custom error types for the application.
//!
//! This module defines the two error enums used across the crate. Both are built with
//! `thiserror` so they compose with `?` and carry readable messages that can be sent
//! straight to a remote operator.
//!
//! ## Error Hierarchy
//!
//! - **`InstrumentError`**: Failures raised behind the [`SourceMeasure`] capability
//!   boundary. A backend only ever reports one of these.
//!   - `NotConfigured`: a source/measure call arrived before any `configure_*` call.
//!   - `RangeExceeded`: no entry in the instrument's range table covers the request.
//!   - `Communication`: the instrument is unreachable or the bus faulted. Never retried.
//!   - `Unsupported`: the instrument lacks a requested feature (e.g. 4-wire sensing).
//! - **`SweepError`**: The application-level taxonomy.
//!   - `Configuration`: bad sweep bounds or an unreachable range. The job ends `Failed`.
//!   - `Instrument`: wraps an [`InstrumentError`] via `#[from]`.
//!   - `Validation`: a malformed inbound command. No job is created.
//!   - `AlreadyRunning`: admission refused because a job is still running.
//!   - `Storage` / `Io`: results-log failures. These never change a job's outcome.
//!   - `Internal`: the job worker died (panicked) before it could finish.
//!   - `FeatureNotEnabled`: functionality compiled out via feature flags.
//!
//! Operator cancellation is deliberately absent: a stopped job ends `Aborted`, which is
//! a normal outcome rather than an error.
//!
//! [`SourceMeasure`]: crate::hardware::capabilities::SourceMeasure

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Errors reported by a source-measure backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    #[error("Source has not been configured yet")]
    NotConfigured,

    #[error("Value {requested} is too large for the available ranges (max {max})")]
    RangeExceeded { requested: f64, max: f64 },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Unsupported by instrument: {0}")]
    Unsupported(String),
}

/// Application-level error taxonomy.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Process was already running (job {job_id})")]
    AlreadyRunning { job_id: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SweepError {
    /// True for failures that stem from the requested sweep rather than the hardware.
    ///
    /// Range selection failures and unsupported wiring requests count as configuration
    /// problems: retrying against the same instrument can never succeed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SweepError::Configuration(_)
                | SweepError::Instrument(InstrumentError::RangeExceeded { .. })
                | SweepError::Instrument(InstrumentError::Unsupported(_))
        )
    }

    /// True when the instrument could not be reached or the bus faulted.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            SweepError::Instrument(InstrumentError::Communication(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SweepError::Instrument(InstrumentError::Communication("port busy".into()));
        assert_eq!(
            err.to_string(),
            "Instrument error: Communication error: port busy"
        );
    }

    #[test]
    fn range_failures_are_configuration_errors() {
        let err: SweepError = InstrumentError::RangeExceeded {
            requested: 25.0,
            max: 20.0,
        }
        .into();
        assert!(err.is_configuration());
        assert!(!err.is_communication());
    }

    #[test]
    fn communication_is_not_configuration() {
        let err: SweepError = InstrumentError::Communication("timeout".into()).into();
        assert!(err.is_communication());
        assert!(!err.is_configuration());
    }

    #[test]
    fn unsupported_wiring_is_configuration_error() {
        let err: SweepError = InstrumentError::Unsupported("4-wire".into()).into();
        assert!(err.is_configuration());
    }

    #[test]
    fn io_errors_convert() {
        let err: SweepError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, SweepError::Io(_)));
        assert_eq!(err.to_string(), "I/O error: gone");
    }

    #[test]
    fn already_running_mentions_job() {
        let err = SweepError::AlreadyRunning { job_id: 42 };
        assert!(err.to_string().contains("42"));
    }
}
