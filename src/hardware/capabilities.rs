//! Source-Measure Capability
//!
//! This module defines the capability trait every source-measure backend implements,
//! plus the opener trait the supervisor uses to obtain a fresh instrument per job.
//! Callers never name a concrete vendor type: a job holds an
//! `Arc<dyn SourceMeasure>` and dispatches through it.
//!
//! # Design Philosophy
//!
//! The capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses interior mutability, so every method takes `&self`
//! - Reports typed [`InstrumentError`]s so callers can tell a range failure
//!   from a bus fault
//!
//! # Session contract
//!
//! A session starts when the instrument is opened. Until one of the `configure_*`
//! methods succeeds, [`SourceMeasure::set_source_value`],
//! [`SourceMeasure::source_value`] and [`SourceMeasure::measured_value`] fail with
//! [`InstrumentError::NotConfigured`]. The `configure_*` methods pick the operating
//! range through [`select_range`](super::range::select_range) and propagate its
//! failure unchanged.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn single_point(smu: &dyn SourceMeasure) -> Result<f64, InstrumentError> {
//!     smu.configure_voltage_source(2.0, 0.01, Wiring::TwoWire).await?;
//!     smu.enable_source().await?;
//!     smu.set_source_value(1.5).await?;
//!     let amps = smu.measured_value().await?;
//!     smu.shutdown().await?;
//!     Ok(amps)
//! }
//! ```

use crate::error::InstrumentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Quantity the instrument drives. The complementary quantity is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// Source voltage, measure current
    Voltage,
    /// Source current, measure voltage
    Current,
}

impl SourceType {
    /// SCPI function mnemonic for the sourced quantity
    pub fn scpi_function(self) -> &'static str {
        match self {
            SourceType::Voltage => "VOLT",
            SourceType::Current => "CURR",
        }
    }

    /// Quantity measured while sourcing `self`
    pub fn complement(self) -> SourceType {
        match self {
            SourceType::Voltage => SourceType::Current,
            SourceType::Current => SourceType::Voltage,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Voltage => write!(f, "voltage"),
            SourceType::Current => write!(f, "current"),
        }
    }
}

/// Measurement wiring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Wiring {
    /// Force and sense share leads
    #[default]
    TwoWire,
    /// Separate sense leads (remote sensing)
    FourWire,
}

impl Wiring {
    /// Map the wire-format `4-wire?` flag onto a wiring mode.
    pub fn from_four_wire(four_wire: bool) -> Self {
        if four_wire {
            Wiring::FourWire
        } else {
            Wiring::TwoWire
        }
    }
}

/// Capability: Source-Measure Unit
///
/// Sources a controlled quantity (voltage or current) while measuring its
/// complement, protected by a compliance limit on the measured quantity.
///
/// # Contract
/// - `configure_*` selects the minimal range covering `limit`
/// - Output is off until `enable_source` is called
/// - `shutdown` disables the output and leaves the instrument safe; it must be
///   callable in any state, including before configuration
/// - After `close`, every other call fails with `Communication`
#[async_trait]
pub trait SourceMeasure: Send + Sync {
    /// Source voltage and measure current.
    ///
    /// # Arguments
    /// * `voltage_limit` - Largest |voltage| the sweep will request
    /// * `compliance_current` - Current ceiling protecting the device under test
    /// * `wiring` - 2-wire or 4-wire sensing
    async fn configure_voltage_source(
        &self,
        voltage_limit: f64,
        compliance_current: f64,
        wiring: Wiring,
    ) -> Result<(), InstrumentError>;

    /// Source current and measure voltage.
    ///
    /// # Arguments
    /// * `current_limit` - Largest |current| the sweep will request
    /// * `compliance_voltage` - Voltage ceiling protecting the device under test
    /// * `wiring` - 2-wire or 4-wire sensing
    async fn configure_current_source(
        &self,
        current_limit: f64,
        compliance_voltage: f64,
        wiring: Wiring,
    ) -> Result<(), InstrumentError>;

    /// Read back the programmed source level (V or A)
    async fn source_value(&self) -> Result<f64, InstrumentError>;

    /// Program the source level (V or A)
    async fn set_source_value(&self, value: f64) -> Result<(), InstrumentError>;

    /// Measure the complementary quantity (A when sourcing V, V when sourcing A)
    async fn measured_value(&self) -> Result<f64, InstrumentError>;

    /// Turn the source output on
    async fn enable_source(&self) -> Result<(), InstrumentError>;

    /// Turn the source output off and return to a safe state
    async fn shutdown(&self) -> Result<(), InstrumentError>;

    /// Release the communication channel
    async fn close(&self) -> Result<(), InstrumentError>;

    /// Whether remote (4-wire) sensing is available
    fn supports_4_wire(&self) -> bool {
        false
    }
}

/// Opens a fresh [`SourceMeasure`] session for an instrument address.
///
/// Each job opens its own session and owns it until shutdown, so an opener is the
/// only thing the supervisor keeps between jobs.
#[async_trait]
pub trait InstrumentOpener: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Connect to the instrument at `address`
    async fn open(&self, address: &str) -> Result<Arc<dyn SourceMeasure>, InstrumentError>;
}
