//! Sweep generation.
//!
//! Produces the ordered setpoint sequence a measurement job applies. Pure and
//! deterministic: the same arguments always yield the same values.
//!
//! # Shapes
//!
//! ```text
//! one-way          start ──────────▶ end                      (count points)
//! both ways, odd   start ──▶ end ──▶ start   apex sampled once  (count points)
//! both ways, even  start ──▶ end ▶ end ──▶ start   apex twice   (count points)
//! ```
//!
//! The even bidirectional shape repeats the turnaround point. It is kept as-is so
//! recorded runs stay comparable with earlier data sets.

/// `count` evenly spaced points from `start` to `end` inclusive.
///
/// `count == 1` yields `[start]`; `count == 0` yields nothing.
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let last = count - 1;
            (0..count)
                .map(|i| {
                    if i == last {
                        end
                    } else {
                        start + (end - start) * i as f64 / last as f64
                    }
                })
                .collect()
        }
    }
}

/// Generate the setpoint sequence for a sweep.
///
/// The result always holds exactly `count` values.
///
/// - `both_ways == false` (or `count < 2`): [`linspace`] from `start` to `end`
/// - `both_ways`, odd `count`: `ceil(count/2)` points up to `end`, then back down
///   to `start` without repeating `end`
/// - `both_ways`, even `count`: `count/2` points up, then `count/2` points from
///   `end` back to `start`; `end` appears twice in a row
pub fn generate_sweep(start: f64, end: f64, count: usize, both_ways: bool) -> Vec<f64> {
    if !both_ways || count < 2 {
        return linspace(start, end, count);
    }

    if count % 2 == 1 {
        let ascending = linspace(start, end, count.div_ceil(2));
        let descending: Vec<f64> = ascending[..ascending.len() - 1]
            .iter()
            .rev()
            .copied()
            .collect();
        ascending.into_iter().chain(descending).collect()
    } else {
        let half = count / 2;
        let mut points = linspace(start, end, half);
        points.extend(linspace(end, start, half));
        points
    }
}
