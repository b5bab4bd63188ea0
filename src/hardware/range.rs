//! Range selection for source-measure instruments.
//!
//! Pure and deterministic: no I/O, no instrument state.

use crate::error::InstrumentError;

/// Keithley 2400 source voltage ranges (V)
pub const KEITHLEY_2400_VOLTAGE_RANGES: [f64; 3] = [0.2, 2.0, 20.0];

/// Keithley 2400 source current ranges (A)
pub const KEITHLEY_2400_CURRENT_RANGES: [f64; 7] = [1e-6, 1e-5, 1e-4, 1e-3, 1e-2, 1e-1, 1.0];

/// Return the smallest entry of `ranges` that covers `|requested|`.
///
/// `ranges` is expected in ascending order, but the minimum is taken over every
/// qualifying entry so an unsorted table still yields the minimal covering range.
///
/// # Errors
/// [`InstrumentError::RangeExceeded`] if no entry is large enough (or the table is empty).
pub fn select_range(requested: f64, ranges: &[f64]) -> Result<f64, InstrumentError> {
    let magnitude = requested.abs();
    ranges
        .iter()
        .copied()
        .filter(|range| *range >= magnitude)
        .min_by(f64::total_cmp)
        .ok_or_else(|| InstrumentError::RangeExceeded {
            requested,
            max: ranges
                .iter()
                .copied()
                .max_by(f64::total_cmp)
                .unwrap_or(0.0),
        })
}
