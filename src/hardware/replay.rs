//! Replay instrument for synthetic `test` runs.
//!
//! `ReplaySmu` stands in for hardware when a command carries a literal list of
//! (voltage, current) pairs. The job drives it exactly like a real instrument; each
//! source write advances a cursor and the following measurement returns the paired
//! value from the list.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::InstrumentError;
use crate::hardware::capabilities::{SourceMeasure, SourceType, Wiring};

/// One literal (voltage, current) pair.
///
/// Serialized as a two-element array `[voltage, current]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplaySample(pub f64, pub f64);

impl ReplaySample {
    /// Voltage component
    pub fn voltage(&self) -> f64 {
        self.0
    }

    /// Current component
    pub fn current(&self) -> f64 {
        self.1
    }
}

#[derive(Debug, Default)]
struct ReplayState {
    source_type: Option<SourceType>,
    level: f64,
    cursor: usize,
    output_enabled: bool,
    closed: bool,
}

/// Instrument replaying a fixed list of samples
pub struct ReplaySmu {
    samples: Vec<ReplaySample>,
    state: Mutex<ReplayState>,
}

impl ReplaySmu {
    /// Create a replay instrument over `samples`
    pub fn new(samples: Vec<ReplaySample>) -> Self {
        Self {
            samples,
            state: Mutex::new(ReplayState::default()),
        }
    }

    /// Whether the (virtual) output is on
    pub fn output_enabled(&self) -> bool {
        self.state.lock().output_enabled
    }

    fn configure(&self, source_type: SourceType, limit: f64) -> Result<(), InstrumentError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(InstrumentError::Communication(
                "ReplaySmu: connection closed".to_string(),
            ));
        }
        if !limit.is_finite() {
            return Err(InstrumentError::RangeExceeded {
                requested: limit,
                max: f64::MAX,
            });
        }
        state.source_type = Some(source_type);
        state.cursor = 0;
        Ok(())
    }

    fn configured(state: &ReplayState) -> Result<SourceType, InstrumentError> {
        if state.closed {
            return Err(InstrumentError::Communication(
                "ReplaySmu: connection closed".to_string(),
            ));
        }
        state.source_type.ok_or(InstrumentError::NotConfigured)
    }
}

#[async_trait]
impl SourceMeasure for ReplaySmu {
    async fn configure_voltage_source(
        &self,
        voltage_limit: f64,
        _compliance_current: f64,
        _wiring: Wiring,
    ) -> Result<(), InstrumentError> {
        self.configure(SourceType::Voltage, voltage_limit)
    }

    async fn configure_current_source(
        &self,
        current_limit: f64,
        _compliance_voltage: f64,
        _wiring: Wiring,
    ) -> Result<(), InstrumentError> {
        self.configure(SourceType::Current, current_limit)
    }

    async fn source_value(&self) -> Result<f64, InstrumentError> {
        let state = self.state.lock();
        Self::configured(&state)?;
        Ok(state.level)
    }

    async fn set_source_value(&self, value: f64) -> Result<(), InstrumentError> {
        let mut state = self.state.lock();
        Self::configured(&state)?;
        state.level = value;
        state.cursor += 1;
        Ok(())
    }

    async fn measured_value(&self) -> Result<f64, InstrumentError> {
        let state = self.state.lock();
        let source_type = Self::configured(&state)?;
        let sample = state
            .cursor
            .checked_sub(1)
            .and_then(|index| self.samples.get(index))
            .ok_or_else(|| {
                InstrumentError::Communication(format!(
                    "ReplaySmu: no sample for step {} ({} available)",
                    state.cursor,
                    self.samples.len()
                ))
            })?;

        Ok(match source_type {
            SourceType::Voltage => sample.current(),
            SourceType::Current => sample.voltage(),
        })
    }

    async fn enable_source(&self) -> Result<(), InstrumentError> {
        self.state.lock().output_enabled = true;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), InstrumentError> {
        let mut state = self.state.lock();
        state.output_enabled = false;
        state.level = 0.0;
        Ok(())
    }

    async fn close(&self) -> Result<(), InstrumentError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn supports_4_wire(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_pairs_in_order() {
        let smu = ReplaySmu::new(vec![ReplaySample(0.0, 0.0), ReplaySample(1.0, 0.5)]);
        smu.configure_voltage_source(1.0, 1.0, Wiring::TwoWire)
            .await
            .unwrap();

        smu.set_source_value(0.0).await.unwrap();
        assert_eq!(smu.measured_value().await.unwrap(), 0.0);
        smu.set_source_value(1.0).await.unwrap();
        assert_eq!(smu.measured_value().await.unwrap(), 0.5);

        // past the end of the list
        smu.set_source_value(2.0).await.unwrap();
        assert!(smu.measured_value().await.is_err());
    }

    #[tokio::test]
    async fn requires_configuration() {
        let smu = ReplaySmu::new(vec![ReplaySample(0.0, 0.0)]);
        assert_eq!(
            smu.set_source_value(0.0).await,
            Err(InstrumentError::NotConfigured)
        );
    }

    #[test]
    fn sample_deserializes_from_pair() {
        let sample: ReplaySample = serde_json::from_str("[1.5, 0.002]").unwrap();
        assert_eq!(sample.voltage(), 1.5);
        assert_eq!(sample.current(), 0.002);
    }
}
