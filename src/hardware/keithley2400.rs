//! Keithley 2400 SourceMeter Driver
//!
//! Reference: Keithley Series 2400 SourceMeter User's Manual, SCPI command reference
//!
//! Protocol Overview:
//! - Format: SCPI over RS-232
//! - Baud: 9600 (configurable on the front panel), 8N1, no flow control
//! - Terminator: LF (\n)
//! - Source setup: `:SOUR:FUNC`, `:SOUR:<F>:RANG`, `:SENS:<F>:PROT`
//! - Measurement: `:READ?` returns the element(s) selected with `:FORM:ELEM`
//!
//! # Important Notes
//!
//! - `:FORM:ELEM` is narrowed to the measured quantity so `:READ?` returns one value
//! - 4-wire sensing is toggled with `:SYST:RSEN ON|OFF`
//! - Configuration commands produce no response; only queries are read back
//!
//! Command construction is kept in pure functions so it can be tested without a
//! serial port. The serial transport itself needs the `serial` feature.
//!
//! # Example Usage
//!
//! ```no_run
//! # #[cfg(feature = "serial")]
//! # async fn demo() -> Result<(), smu_sweep::error::InstrumentError> {
//! use smu_sweep::hardware::capabilities::{SourceMeasure, Wiring};
//! use smu_sweep::hardware::keithley2400::Keithley2400Driver;
//!
//! let smu = Keithley2400Driver::open("ASRL7::INSTR", 9600)?;
//! smu.configure_voltage_source(2.0, 0.01, Wiring::TwoWire).await?;
//! smu.enable_source().await?;
//! smu.set_source_value(1.0).await?;
//! println!("I = {:.3e} A", smu.measured_value().await?);
//! smu.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::InstrumentError;
use crate::hardware::capabilities::{SourceType, Wiring};

/// Resolve an instrument address to a serial port path.
///
/// Accepts VISA serial resources (`ASRL7::INSTR`, `ASRL/dev/ttyUSB0::INSTR`), a bare
/// port number as sent by older clients (`7`) and plain device paths
/// (`/dev/ttyUSB0`, `COM3`).
pub fn resolve_serial_port(address: &str) -> String {
    let trimmed = address.trim();
    let resource = trimmed
        .strip_prefix("ASRL")
        .map(|rest| rest.strip_suffix("::INSTR").unwrap_or(rest))
        .unwrap_or(trimmed);

    if !resource.is_empty() && resource.chars().all(|c| c.is_ascii_digit()) {
        numbered_port(resource)
    } else {
        resource.to_string()
    }
}

#[cfg(windows)]
fn numbered_port(number: &str) -> String {
    format!("COM{}", number)
}

#[cfg(not(windows))]
fn numbered_port(number: &str) -> String {
    format!("/dev/ttyS{}", number)
}

/// SCPI sequence selecting the source function, range, compliance and wiring.
pub fn configure_commands(
    source_type: SourceType,
    range: f64,
    compliance: f64,
    wiring: Wiring,
) -> Vec<String> {
    let source = source_type.scpi_function();
    let sense = source_type.complement().scpi_function();
    let remote_sense = match wiring {
        Wiring::FourWire => "ON",
        Wiring::TwoWire => "OFF",
    };

    vec![
        format!(":SOUR:FUNC {}", source),
        format!(":SOUR:{}:MODE FIX", source),
        format!(":SENS:FUNC '{}'", sense),
        format!(":FORM:ELEM {}", sense),
        format!(":SOUR:{}:RANG {}", source, range),
        format!(":SENS:{}:PROT {}", sense, compliance),
        format!(":SYST:RSEN {}", remote_sense),
    ]
}

/// Command programming the source level.
pub fn set_level_command(source_type: SourceType, value: f64) -> String {
    format!(":SOUR:{}:LEV {}", source_type.scpi_function(), value)
}

/// Query reading back the source level.
pub fn level_query(source_type: SourceType) -> String {
    format!(":SOUR:{}:LEV?", source_type.scpi_function())
}

/// Parse a `:READ?` / level query response.
///
/// Takes the first comma-separated element, so a response with more elements than
/// requested still yields the primary value.
pub fn parse_reading(response: &str) -> Result<f64, InstrumentError> {
    let first = response.trim().split(',').next().unwrap_or("").trim();
    if first.is_empty() {
        return Err(InstrumentError::Communication(
            "Keithley 2400: empty response".to_string(),
        ));
    }
    first.parse::<f64>().map_err(|_| {
        InstrumentError::Communication(format!(
            "Keithley 2400: failed to parse response '{}'",
            response.trim()
        ))
    })
}

/// Command sequence that leaves the instrument safe: level to zero, output off.
///
/// `:OUTP OFF` is always present and always last, so it is still sent when the
/// source was never configured.
pub fn shutdown_commands(source_type: Option<SourceType>) -> Vec<String> {
    let mut commands: Vec<String> = source_type
        .map(|source_type| set_level_command(source_type, 0.0))
        .into_iter()
        .collect();
    commands.push(":OUTP OFF".to_string());
    commands
}

pub use driver::{Keithley2400Driver, Transport};
#[cfg(feature = "serial")]
pub use driver::Keithley2400Opener;

mod driver {
    use super::*;
    use crate::hardware::capabilities::SourceMeasure;
    use crate::hardware::range::{
        select_range, KEITHLEY_2400_CURRENT_RANGES, KEITHLEY_2400_VOLTAGE_RANGES,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::sync::Mutex;
    use tracing::{debug, warn};

    /// Byte stream the driver talks SCPI over
    pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

    impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

    /// Driver for the Keithley 2400 SourceMeter
    ///
    /// Implements the `SourceMeasure` capability over SCPI.
    pub struct Keithley2400Driver {
        /// Line-buffered transport; `None` once closed
        port: Mutex<Option<BufReader<Box<dyn Transport>>>>,
        /// Quantity selected by the last successful configure
        source_type: parking_lot::Mutex<Option<SourceType>>,
        /// Set when a query timed out; the rest of that reply may still arrive
        out_of_sync: AtomicBool,
        /// Query timeout
        timeout: Duration,
    }

    impl Keithley2400Driver {
        /// Driver over an already connected byte stream
        pub fn from_transport(transport: impl Transport + 'static) -> Self {
            let transport: Box<dyn Transport> = Box::new(transport);
            Self {
                port: Mutex::new(Some(BufReader::new(transport))),
                source_type: parking_lot::Mutex::new(None),
                out_of_sync: AtomicBool::new(false),
                timeout: Duration::from_secs(2),
            }
        }

        /// Change the query timeout
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        fn configured(&self) -> Result<SourceType, InstrumentError> {
            self.source_type.lock().ok_or(InstrumentError::NotConfigured)
        }

        /// Send a command without expecting a response
        async fn write(&self, command: &str) -> Result<(), InstrumentError> {
            let mut guard = self.port.lock().await;
            let port = guard.as_mut().ok_or_else(closed)?;
            debug!(command, "Keithley 2400 <-");
            port.get_mut()
                .write_all(format!("{}\n", command).as_bytes())
                .await
                .map_err(|e| {
                    InstrumentError::Communication(format!("Keithley 2400 write failed: {}", e))
                })
        }

        /// Send query and read response.
        ///
        /// After a read timeout the reply stream can no longer be matched to
        /// queries, so every later query fails. Plain writes (shutdown) still go out.
        async fn query(&self, command: &str) -> Result<String, InstrumentError> {
            if self.out_of_sync.load(Ordering::SeqCst) {
                return Err(InstrumentError::Communication(
                    "Keithley 2400 session out of sync after a read timeout".to_string(),
                ));
            }

            let mut guard = self.port.lock().await;
            let port = guard.as_mut().ok_or_else(closed)?;
            port.get_mut()
                .write_all(format!("{}\n", command).as_bytes())
                .await
                .map_err(|e| {
                    InstrumentError::Communication(format!("Keithley 2400 write failed: {}", e))
                })?;

            let mut response = String::new();
            match tokio::time::timeout(self.timeout, port.read_line(&mut response)).await {
                Ok(read) => {
                    read.map_err(|e| {
                        InstrumentError::Communication(format!("Keithley 2400 read failed: {}", e))
                    })?;
                }
                Err(_) => {
                    self.out_of_sync.store(true, Ordering::SeqCst);
                    return Err(InstrumentError::Communication(format!(
                        "Keithley 2400 read timeout for '{}'",
                        command
                    )));
                }
            }

            debug!(command, response = response.trim(), "Keithley 2400 ->");
            Ok(response)
        }

        async fn configure(
            &self,
            source_type: SourceType,
            limit: f64,
            compliance: f64,
            wiring: Wiring,
        ) -> Result<(), InstrumentError> {
            let table: &[f64] = match source_type {
                SourceType::Voltage => &KEITHLEY_2400_VOLTAGE_RANGES,
                SourceType::Current => &KEITHLEY_2400_CURRENT_RANGES,
            };
            let range = select_range(limit, table)?;

            for command in configure_commands(source_type, range, compliance, wiring) {
                self.write(&command).await?;
            }
            *self.source_type.lock() = Some(source_type);
            Ok(())
        }
    }

    fn closed() -> InstrumentError {
        InstrumentError::Communication("Keithley 2400 connection closed".to_string())
    }

    #[async_trait]
    impl SourceMeasure for Keithley2400Driver {
        async fn configure_voltage_source(
            &self,
            voltage_limit: f64,
            compliance_current: f64,
            wiring: Wiring,
        ) -> Result<(), InstrumentError> {
            self.configure(SourceType::Voltage, voltage_limit, compliance_current, wiring)
                .await
        }

        async fn configure_current_source(
            &self,
            current_limit: f64,
            compliance_voltage: f64,
            wiring: Wiring,
        ) -> Result<(), InstrumentError> {
            self.configure(SourceType::Current, current_limit, compliance_voltage, wiring)
                .await
        }

        async fn source_value(&self) -> Result<f64, InstrumentError> {
            let source_type = self.configured()?;
            let response = self.query(&level_query(source_type)).await?;
            parse_reading(&response)
        }

        async fn set_source_value(&self, value: f64) -> Result<(), InstrumentError> {
            let source_type = self.configured()?;
            self.write(&set_level_command(source_type, value)).await
        }

        async fn measured_value(&self) -> Result<f64, InstrumentError> {
            self.configured()?;
            let response = self.query(":READ?").await?;
            parse_reading(&response)
        }

        async fn enable_source(&self) -> Result<(), InstrumentError> {
            self.write(":OUTP ON").await
        }

        /// Sends every shutdown command even if an earlier one fails; returns the
        /// first failure.
        async fn shutdown(&self) -> Result<(), InstrumentError> {
            let source_type = *self.source_type.lock();
            let mut first_error = None;
            for command in shutdown_commands(source_type) {
                if let Err(err) = self.write(&command).await {
                    warn!(command = %command, error = %err, "Keithley 2400 shutdown command failed");
                    first_error.get_or_insert(err);
                }
            }
            first_error.map_or(Ok(()), Err)
        }

        async fn close(&self) -> Result<(), InstrumentError> {
            // Dropping the stream releases the OS handle
            self.port.lock().await.take();
            Ok(())
        }

        fn supports_4_wire(&self) -> bool {
            true
        }
    }

    #[cfg(feature = "serial")]
    pub use serial::Keithley2400Opener;

    #[cfg(feature = "serial")]
    mod serial {
        use super::*;
        use crate::hardware::capabilities::InstrumentOpener;
        use std::sync::Arc;
        use tokio_serial::SerialPortBuilderExt;
        use tracing::info;

        impl Keithley2400Driver {
            /// Open the instrument at `address` over RS-232 (8N1, no flow control)
            ///
            /// # Errors
            /// Returns `Communication` if the serial port cannot be opened
            pub fn open(address: &str, baud_rate: u32) -> Result<Self, InstrumentError> {
                let path = resolve_serial_port(address);
                let port = tokio_serial::new(&path, baud_rate)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One)
                    .flow_control(tokio_serial::FlowControl::None)
                    .open_native_async()
                    .map_err(|e| {
                        InstrumentError::Communication(format!(
                            "Failed to open Keithley 2400 serial port '{}': {}",
                            path, e
                        ))
                    })?;

                info!(address, port = %path, baud_rate, "Opened Keithley 2400");
                Ok(Self::from_transport(port))
            }
        }

        /// Opens a `Keithley2400Driver` per job
        pub struct Keithley2400Opener {
            baud_rate: u32,
        }

        impl Keithley2400Opener {
            /// Opener using `baud_rate` for every connection
            pub fn new(baud_rate: u32) -> Self {
                Self { baud_rate }
            }
        }

        #[async_trait]
        impl InstrumentOpener for Keithley2400Opener {
            fn name(&self) -> &str {
                "keithley2400"
            }

            async fn open(
                &self,
                address: &str,
            ) -> Result<Arc<dyn SourceMeasure>, InstrumentError> {
                Ok(Arc::new(Keithley2400Driver::open(address, self.baud_rate)?))
            }
        }
    }
}
