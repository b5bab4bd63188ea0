//! Mock Hardware Implementations
//!
//! Provides a simulated source-measure unit for testing without physical hardware.
//! All mock delays use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Simulation model
//!
//! `MockSmu` drives a purely resistive device under test (1 kΩ by default):
//! - Sourcing voltage `V` measures `I = V / R`, clamped to ± compliance current
//! - Sourcing current `I` measures `V = I · R`, clamped to ± compliance voltage
//!
//! It uses the Keithley 2400 range tables so range failures behave like the real
//! instrument, and it supports 4-wire sensing.
//!
//! # Observability
//!
//! Every `MockSmu` reports into a shared [`MockProbe`] so tests can assert on call
//! counts (enable/shutdown/close), the setpoints actually written and whether the
//! output was left enabled.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::error::InstrumentError;
use crate::hardware::capabilities::{InstrumentOpener, SourceMeasure, SourceType, Wiring};
use crate::hardware::range::{
    select_range, KEITHLEY_2400_CURRENT_RANGES, KEITHLEY_2400_VOLTAGE_RANGES,
};

/// Counters and recordings shared between a `MockSmu` and the test observing it.
#[derive(Debug, Default)]
pub struct MockProbe {
    address: Mutex<String>,
    enable_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
    close_calls: AtomicUsize,
    output_enabled: AtomicBool,
    setpoints: Mutex<Vec<f64>>,
    selected_range: Mutex<Option<f64>>,
    wiring: Mutex<Option<Wiring>>,
}

impl MockProbe {
    /// Address the instrument was opened with
    pub fn address(&self) -> String {
        self.address.lock().clone()
    }

    /// Number of `enable_source` calls
    pub fn enable_calls(&self) -> usize {
        self.enable_calls.load(Ordering::SeqCst)
    }

    /// Number of `shutdown` calls
    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Number of `close` calls
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Whether the source output is currently on
    pub fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    /// Every setpoint written, in order
    pub fn setpoints(&self) -> Vec<f64> {
        self.setpoints.lock().clone()
    }

    /// Range picked by the last `configure_*` call
    pub fn selected_range(&self) -> Option<f64> {
        *self.selected_range.lock()
    }

    /// Wiring requested by the last `configure_*` call
    pub fn wiring(&self) -> Option<Wiring> {
        *self.wiring.lock()
    }
}

#[derive(Debug, Clone, Copy)]
struct SourceConfig {
    source_type: SourceType,
    compliance: f64,
}

#[derive(Debug, Default)]
struct MockState {
    config: Option<SourceConfig>,
    level: f64,
    measurements: usize,
    closed: bool,
}

/// Simulated source-measure unit with a resistive load
///
/// # Example
///
/// ```rust,ignore
/// let smu = MockSmu::new();
/// smu.configure_voltage_source(1.0, 0.01, Wiring::TwoWire).await?;
/// smu.set_source_value(1.0).await?;
/// assert_eq!(smu.measured_value().await?, 1e-3); // 1 V across 1 kΩ
/// ```
pub struct MockSmu {
    resistance_ohms: f64,
    step_latency: Duration,
    fail_measurement_at: Option<usize>,
    panic_measurement_at: Option<usize>,
    state: Mutex<MockState>,
    probe: Arc<MockProbe>,
}

impl MockSmu {
    /// Create a mock with a 1 kΩ load and no latency
    pub fn new() -> Self {
        Self::with_probe(Arc::new(MockProbe::default()))
    }

    /// Create a mock reporting into an existing probe
    pub fn with_probe(probe: Arc<MockProbe>) -> Self {
        Self {
            resistance_ohms: 1_000.0,
            step_latency: Duration::ZERO,
            fail_measurement_at: None,
            panic_measurement_at: None,
            state: Mutex::new(MockState::default()),
            probe,
        }
    }

    /// Change the simulated load
    pub fn with_resistance(mut self, ohms: f64) -> Self {
        self.resistance_ohms = ohms;
        self
    }

    /// Delay every source write by `latency` (simulated bus round-trip)
    pub fn with_step_latency(mut self, latency: Duration) -> Self {
        self.step_latency = latency;
        self
    }

    /// Make the n-th (0-based) measurement fail with a communication error
    pub fn with_measurement_failure_at(mut self, index: usize) -> Self {
        self.fail_measurement_at = Some(index);
        self
    }

    /// Make the n-th (0-based) measurement panic, as a driver bug would
    pub fn with_panic_at(mut self, index: usize) -> Self {
        self.panic_measurement_at = Some(index);
        self
    }

    /// Probe shared with this instrument
    pub fn probe(&self) -> Arc<MockProbe> {
        Arc::clone(&self.probe)
    }

    fn check_open(state: &MockState) -> Result<(), InstrumentError> {
        if state.closed {
            return Err(InstrumentError::Communication(
                "MockSmu: connection closed".to_string(),
            ));
        }
        Ok(())
    }

    fn configure(
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
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let range = select_range(limit, table)?;

        debug!(%source_type, range, compliance, ?wiring, "MockSmu: configured");
        state.config = Some(SourceConfig {
            source_type,
            compliance: compliance.abs(),
        });
        state.level = 0.0;
        *self.probe.selected_range.lock() = Some(range);
        *self.probe.wiring.lock() = Some(wiring);
        Ok(())
    }
}

impl Default for MockSmu {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceMeasure for MockSmu {
    async fn configure_voltage_source(
        &self,
        voltage_limit: f64,
        compliance_current: f64,
        wiring: Wiring,
    ) -> Result<(), InstrumentError> {
        self.configure(SourceType::Voltage, voltage_limit, compliance_current, wiring)
    }

    async fn configure_current_source(
        &self,
        current_limit: f64,
        compliance_voltage: f64,
        wiring: Wiring,
    ) -> Result<(), InstrumentError> {
        self.configure(SourceType::Current, current_limit, compliance_voltage, wiring)
    }

    async fn source_value(&self) -> Result<f64, InstrumentError> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        state
            .config
            .map(|_| state.level)
            .ok_or(InstrumentError::NotConfigured)
    }

    async fn set_source_value(&self, value: f64) -> Result<(), InstrumentError> {
        {
            let state = self.state.lock();
            Self::check_open(&state)?;
            if state.config.is_none() {
                return Err(InstrumentError::NotConfigured);
            }
        }

        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        if !self.step_latency.is_zero() {
            sleep(self.step_latency).await;
        }

        self.state.lock().level = value;
        self.probe.setpoints.lock().push(value);
        Ok(())
    }

    #[allow(clippy::panic)]
    async fn measured_value(&self) -> Result<f64, InstrumentError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let config = state.config.ok_or(InstrumentError::NotConfigured)?;

        let index = state.measurements;
        state.measurements += 1;
        if self.panic_measurement_at == Some(index) {
            drop(state);
            panic!("MockSmu: injected panic at measurement {}", index);
        }
        if self.fail_measurement_at == Some(index) {
            return Err(InstrumentError::Communication(format!(
                "MockSmu: injected read failure at measurement {}",
                index
            )));
        }

        let raw = match config.source_type {
            SourceType::Voltage => state.level / self.resistance_ohms,
            SourceType::Current => state.level * self.resistance_ohms,
        };
        Ok(raw.clamp(-config.compliance, config.compliance))
    }

    async fn enable_source(&self) -> Result<(), InstrumentError> {
        Self::check_open(&self.state.lock())?;
        self.probe.enable_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.output_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), InstrumentError> {
        self.probe.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.level = 0.0;
        self.probe.output_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), InstrumentError> {
        self.probe.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().closed = true;
        Ok(())
    }

    fn supports_4_wire(&self) -> bool {
        true
    }
}

/// Opener handing out a fresh [`MockSmu`] per job
///
/// The probe of every instrument it opened is kept so tests can inspect
/// what a finished job did to its hardware.
pub struct MockOpener {
    resistance_ohms: f64,
    step_latency: Duration,
    fail_measurement_at: Option<usize>,
    panic_measurement_at: Option<usize>,
    unreachable: HashSet<String>,
    opened: Mutex<Vec<Arc<MockProbe>>>,
}

impl MockOpener {
    /// Opener producing default mocks
    pub fn new() -> Self {
        Self {
            resistance_ohms: 1_000.0,
            step_latency: Duration::ZERO,
            fail_measurement_at: None,
            panic_measurement_at: None,
            unreachable: HashSet::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Load resistance for every opened mock
    pub fn with_resistance(mut self, ohms: f64) -> Self {
        self.resistance_ohms = ohms;
        self
    }

    /// Per-step latency for every opened mock
    pub fn with_step_latency(mut self, latency: Duration) -> Self {
        self.step_latency = latency;
        self
    }

    /// Inject a measurement failure into every opened mock
    pub fn with_measurement_failure_at(mut self, index: usize) -> Self {
        self.fail_measurement_at = Some(index);
        self
    }

    /// Make every opened mock panic on the n-th measurement
    pub fn with_panic_at(mut self, index: usize) -> Self {
        self.panic_measurement_at = Some(index);
        self
    }

    /// Refuse to open `address`, as if nothing answered on that port
    pub fn with_unreachable(mut self, address: &str) -> Self {
        self.unreachable.insert(address.to_string());
        self
    }

    /// Probes of all instruments opened so far, oldest first
    pub fn probes(&self) -> Vec<Arc<MockProbe>> {
        self.opened.lock().clone()
    }

    /// Probe of the most recently opened instrument
    pub fn last_probe(&self) -> Option<Arc<MockProbe>> {
        self.opened.lock().last().cloned()
    }
}

impl Default for MockOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstrumentOpener for MockOpener {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, address: &str) -> Result<Arc<dyn SourceMeasure>, InstrumentError> {
        if self.unreachable.contains(address) {
            return Err(InstrumentError::Communication(format!(
                "MockOpener: no instrument answering at '{}'",
                address
            )));
        }

        let probe = Arc::new(MockProbe::default());
        *probe.address.lock() = address.to_string();
        self.opened.lock().push(Arc::clone(&probe));

        let mut smu = MockSmu::with_probe(probe)
            .with_resistance(self.resistance_ohms)
            .with_step_latency(self.step_latency);
        smu.fail_measurement_at = self.fail_measurement_at;
        smu.panic_measurement_at = self.panic_measurement_at;
        Ok(Arc::new(smu))
    }
}
