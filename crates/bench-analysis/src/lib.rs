//! Statistical reduction of benchmark samples.
//!
//! Samples flow one way: a [`SampleSet`] is reduced to a [`ReducedStatistic`],
//! two reduced statistics are combined by [`compare`], and the ratios of a
//! whole sweep are folded into one figure by [`summarize`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sample count at which the single minimum and maximum are discarded.
pub const TRIM_THRESHOLD: usize = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("no valid ratios to summarize (input empty or every ratio is zero)")]
    NoValidRatios,
}

/// Ordered per-iteration measurements. NaN marks an iteration that failed to
/// produce a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleSet {
    values: Vec<f64>,
}

impl SampleSet {
    pub fn with_capacity(iterations: usize) -> Self {
        Self {
            values: Vec::with_capacity(iterations),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of iterations recorded as NaN.
    pub fn failed(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }

    pub fn reduce(&self) -> ReducedStatistic {
        reduce(&self.values)
    }
}

impl From<Vec<f64>> for SampleSet {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReducedStatistic {
    pub center: f64,
    /// Population standard deviation of the retained values. Zero with fewer
    /// than two retained values, NaN when nothing was retained.
    pub spread: f64,
    /// Values that contributed to `center` after NaN filtering and trimming.
    pub retained: usize,
    /// NaN samples dropped before reduction.
    pub failed: usize,
    pub trimmed: bool,
}

impl ReducedStatistic {
    /// True when every sample failed and no center could be computed.
    pub fn is_degenerate(&self) -> bool {
        self.center.is_nan()
    }
}

pub fn reduce(samples: &[f64]) -> ReducedStatistic {
    let mut valid: Vec<f64> = samples.iter().copied().filter(|v| !v.is_nan()).collect();
    let failed = samples.len() - valid.len();

    let trimmed = valid.len() >= TRIM_THRESHOLD;
    if trimmed {
        valid.sort_by(f64::total_cmp);
        valid.pop();
        valid.remove(0);
    }

    let Some(center) = mean(&valid) else {
        return ReducedStatistic {
            center: f64::NAN,
            spread: f64::NAN,
            retained: 0,
            failed,
            trimmed,
        };
    };
    let spread = if valid.len() >= 2 {
        population_stddev(&valid, center)
    } else {
        0.0
    };
    ReducedStatistic {
        center,
        spread,
        retained: valid.len(),
        failed,
        trimmed,
    }
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        let sum: f64 = xs.iter().sum();
        Some(sum / (xs.len() as f64))
    }
}

fn population_stddev(xs: &[f64], mean: f64) -> f64 {
    let mut deviation_sum_squared = 0.0;
    for &x in xs {
        deviation_sum_squared += (x - mean).powi(2);
    }
    (deviation_sum_squared / xs.len() as f64).sqrt()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Lower is better (elapsed seconds).
    #[default]
    Latency,
    /// Higher is better (work per unit of time).
    Throughput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Overhead,
    Speedup,
}

impl Unit {
    pub fn direction(self) -> Direction {
        match self {
            Unit::Latency => Direction::Overhead,
            Unit::Throughput => Direction::Speedup,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Unit::Latency => "latency",
            Unit::Throughput => "throughput",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Overhead => f.write_str("overhead"),
            Direction::Speedup => f.write_str("speedup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub ratio: f64,
    pub direction: Direction,
    pub unit: Unit,
}

/// `treatment / baseline`, labelled by the unit's direction. A zero or NaN
/// baseline yields a NaN ratio.
pub fn compare(
    baseline: &ReducedStatistic,
    treatment: &ReducedStatistic,
    unit: Unit,
) -> ComparisonResult {
    let ratio = if baseline.center == 0.0 || baseline.center.is_nan() {
        f64::NAN
    } else {
        treatment.center / baseline.center
    };
    ComparisonResult {
        ratio,
        direction: unit.direction(),
        unit,
    }
}

/// Geometric mean of the non-zero ratios. Zero marks a failed measurement and
/// is excluded from both the product and the count; NaN is not filtered and
/// propagates.
///
/// Computed as `exp(mean(ln r))` so long sweeps cannot overflow or underflow
/// an intermediate product.
pub fn summarize(ratios: &[f64]) -> Result<f64, AnalysisError> {
    let mut log_sum = 0.0;
    let mut count = 0usize;
    for &r in ratios.iter().filter(|r| **r != 0.0) {
        log_sum += r.ln();
        count += 1;
    }
    if count == 0 {
        return Err(AnalysisError::NoValidRatios);
    }
    Ok((log_sum / count as f64).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(center: f64) -> ReducedStatistic {
        ReducedStatistic {
            center,
            spread: 0.0,
            retained: 1,
            failed: 0,
            trimmed: false,
        }
    }

    #[test]
    fn seven_samples_drop_single_min_and_max() {
        let r = reduce(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 100.0]);
        assert!(r.trimmed);
        assert_eq!(r.retained, 5);
        assert_eq!(r.center, 4.0);
        assert!((r.spread - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn six_samples_are_not_trimmed() {
        let r = reduce(&[1.0, 2.0, 3.0, 4.0, 5.0, 100.0]);
        assert!(!r.trimmed);
        assert_eq!(r.retained, 6);
        assert!((r.center - 115.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn trimming_removes_exactly_two_on_large_sets() {
        let mut samples: Vec<f64> = (0..20).map(|v| v as f64).collect();
        samples.push(1_000.0);
        samples.push(-1_000.0);
        let r = reduce(&samples);
        assert_eq!(r.retained, 20);
        assert_eq!(r.center, 9.5);
    }

    #[test]
    fn nan_samples_are_filtered_and_counted() {
        let r = reduce(&[1.0, f64::NAN, 3.0]);
        assert_eq!(r.center, 2.0);
        assert_eq!(r.spread, 1.0);
        assert_eq!(r.failed, 1);
        assert_eq!(r.retained, 2);
    }

    #[test]
    fn nan_samples_do_not_count_towards_trim_threshold() {
        let r = reduce(&[1.0, 2.0, 3.0, 4.0, 5.0, 60.0, f64::NAN]);
        assert!(!r.trimmed);
        assert_eq!(r.retained, 6);
        assert_eq!(r.center, 12.5);
    }

    #[test]
    fn single_sample_has_zero_spread() {
        let r = reduce(&[4.2]);
        assert_eq!(r.center, 4.2);
        assert_eq!(r.spread, 0.0);
    }

    #[test]
    fn degenerate_inputs_reduce_to_nan_without_panicking() {
        let empty = reduce(&[]);
        assert!(empty.center.is_nan());
        assert!(empty.is_degenerate());
        assert_eq!(empty.failed, 0);

        let all_failed = reduce(&[f64::NAN, f64::NAN]);
        assert!(all_failed.center.is_nan());
        assert_eq!(all_failed.failed, 2);
        assert_eq!(all_failed.retained, 0);
    }

    #[test]
    fn reduction_is_repeatable() {
        let set = SampleSet::from(vec![3.0, 1.0, 2.0, 9.0, 4.0, 4.0, 5.0, f64::NAN]);
        let first = set.reduce();
        let second = set.reduce();
        assert_eq!(first, second);
        assert_eq!(set.values()[0], 3.0);
        assert_eq!(set.failed(), 1);
    }

    #[test]
    fn latency_comparison_reports_overhead() {
        let c = compare(&stat(10.0), &stat(12.0), Unit::Latency);
        assert_eq!(c.direction, Direction::Overhead);
        assert!((c.ratio - 1.2).abs() < 1e-12);
    }

    #[test]
    fn throughput_comparison_reports_speedup() {
        let c = compare(&stat(100.0), &stat(150.0), Unit::Throughput);
        assert_eq!(c.direction, Direction::Speedup);
        assert_eq!(c.ratio, 1.5);
    }

    #[test]
    fn zero_or_nan_baseline_yields_nan_ratio() {
        assert!(compare(&stat(0.0), &stat(1.0), Unit::Latency).ratio.is_nan());
        assert!(compare(&stat(f64::NAN), &stat(1.0), Unit::Throughput)
            .ratio
            .is_nan());
    }

    #[test]
    fn geomean_skips_zero_ratios() {
        let g = summarize(&[2.0, 0.5, 0.0]).expect("geomean");
        assert!((g - 1.0).abs() < 1e-12);
        let g = summarize(&[2.0, 8.0]).expect("geomean");
        assert!((g - 4.0).abs() < 1e-12);
    }

    #[test]
    fn geomean_of_long_sweep_stays_finite() {
        let large = vec![1e300; 400];
        let g = summarize(&large).expect("geomean");
        assert!((g / 1e300 - 1.0).abs() < 1e-9, "{}", g);

        let small = vec![1e-300; 400];
        let g = summarize(&small).expect("geomean");
        assert!((g / 1e-300 - 1.0).abs() < 1e-9, "{}", g);
    }

    #[test]
    fn geomean_without_valid_ratios_fails() {
        assert_eq!(summarize(&[]), Err(AnalysisError::NoValidRatios));
        assert_eq!(summarize(&[0.0, 0.0]), Err(AnalysisError::NoValidRatios));
    }

    #[test]
    fn geomean_propagates_nan() {
        let g = summarize(&[1.5, f64::NAN]).expect("nan is not filtered");
        assert!(g.is_nan());
    }

    #[test]
    fn direction_labels_serialize_lowercase() {
        let c = compare(&stat(2.0), &stat(3.0), Unit::Latency);
        let v = serde_json::to_value(c).expect("serialize");
        assert_eq!(v["direction"], "overhead");
        assert_eq!(v["unit"], "latency");
        assert_eq!(Direction::Speedup.to_string(), "speedup");
    }
}
