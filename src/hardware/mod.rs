//! Instrument abstraction layer.
//!
//! - `capabilities`: the `SourceMeasure` trait and the per-job `InstrumentOpener`
//! - `range`: minimal covering range selection
//! - `mock`: simulated instrument for tests and hardware-free runs
//! - `replay`: literal sample playback for `test` commands
//! - `keithley2400`: SCPI driver (serial transport behind the `serial` feature)

pub mod capabilities;
pub mod keithley2400;
pub mod mock;
pub mod range;
pub mod replay;

pub use capabilities::{InstrumentOpener, SourceMeasure, SourceType, Wiring};

use std::sync::Arc;

use crate::config::{InstrumentBackend, InstrumentConfig};
use crate::error::AppResult;

/// Opener for the configured backend.
///
/// # Errors
/// `FeatureNotEnabled` when the Keithley backend is selected without the `serial` feature.
pub fn opener_for(config: &InstrumentConfig) -> AppResult<Arc<dyn InstrumentOpener>> {
    match config.backend {
        InstrumentBackend::Mock => Ok(Arc::new(mock::MockOpener::new())),
        #[cfg(feature = "serial")]
        InstrumentBackend::Keithley2400 => Ok(Arc::new(keithley2400::Keithley2400Opener::new(
            config.baud_rate,
        ))),
        #[cfg(not(feature = "serial"))]
        InstrumentBackend::Keithley2400 => Err(crate::error::SweepError::FeatureNotEnabled(
            "serial".to_string(),
        )),
    }
}
