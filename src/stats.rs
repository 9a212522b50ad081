//! Running latency statistics for accepted samples.
//!
//! The accumulator is owned by exactly one core and never shared, so it needs
//! no synchronisation. Variance is the mean squared deviation from an
//! a-priori baseline (a platform calibration constant), not from the measured
//! mean: a run whose mean lands on the baseline reports its spread, and a run
//! whose mean drifts away shows up both as a larger variance and as a
//! [`BaselineDrift`] warning.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Online sum, count, maximum and squared deviation from `baseline`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accumulator {
    baseline: u64,
    count: u64,
    sum: u128,
    max: u64,
    sum_sq_dev: u128,
}

impl Accumulator {
    /// An empty accumulator measuring deviation from `baseline` cycles.
    pub fn new(baseline: u64) -> Self {
        Self {
            baseline,
            ..Self::default()
        }
    }

    /// Fold one accepted sample.
    #[inline]
    pub fn record(&mut self, cycles: u64) {
        self.count += 1;
        self.sum += cycles as u128;
        if cycles > self.max {
            self.max = cycles;
        }
        let dev = cycles.abs_diff(self.baseline) as u128;
        self.sum_sq_dev = self.sum_sq_dev.saturating_add(dev * dev);
    }

    /// Number of accepted samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether no sample was accepted.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The reference value deviations are measured from.
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Compute mean, maximum and variance.
    ///
    /// Returns [`Error::NoAcceptedSamples`] instead of dividing by zero.
    pub fn finalize(&self) -> Result<LatencySummary> {
        if self.count == 0 {
            return Err(Error::NoAcceptedSamples);
        }
        let n = self.count as f64;
        Ok(LatencySummary {
            count: self.count,
            mean: self.sum as f64 / n,
            max: self.max,
            variance: self.sum_sq_dev as f64 / n,
            baseline: self.baseline,
        })
    }
}

/// Finalised statistics for one measured operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Accepted samples.
    pub count: u64,
    /// Mean cost in cycles.
    pub mean: f64,
    /// Largest accepted sample in cycles.
    pub max: u64,
    /// Mean squared deviation from `baseline` (cycles²).
    pub variance: f64,
    /// A-priori expected mean in cycles.
    pub baseline: u64,
}

impl LatencySummary {
    /// Square root of [`variance`](Self::variance).
    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Compare the measured mean to the baseline.
    ///
    /// Returns a warning when the relative difference exceeds `tolerance`
    /// (0.05 = 5%). A zero baseline means "no expectation" and never warns.
    pub fn drift(&self, tolerance: f64) -> Option<BaselineDrift> {
        if self.baseline == 0 {
            return None;
        }
        let baseline = self.baseline as f64;
        let relative = (self.mean - baseline) / baseline;
        (relative.abs() > tolerance).then_some(BaselineDrift {
            baseline: self.baseline,
            measured: self.mean,
            relative,
        })
    }
}

/// Measured mean disagrees with the a-priori baseline.
///
/// Non-fatal: baselines are per-platform constants and drift may mean a
/// changed environment as much as a benchmark bug.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineDrift {
    /// Expected mean in cycles.
    pub baseline: u64,
    /// Measured mean in cycles.
    pub measured: f64,
    /// Signed relative difference, `(measured - baseline) / baseline`.
    pub relative: f64,
}

impl std::fmt::Display for BaselineDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "assumed average {} not consistent with measured {:.0} ({:+.1}%)",
            self.baseline,
            self.measured,
            self.relative * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_accumulator_reports_no_samples() {
        let acc = Accumulator::new(500);
        assert!(acc.is_empty());
        assert!(matches!(acc.finalize(), Err(Error::NoAcceptedSamples)));
    }

    #[test]
    fn variance_is_measured_from_baseline_not_mean() {
        let mut acc = Accumulator::new(0);
        acc.record(10);
        acc.record(20);
        let s = acc.finalize().unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.mean, 15.0);
        assert_eq!(s.max, 20);
        // (100 + 400) / 2, not the population variance 25.
        assert_eq!(s.variance, 250.0);
    }

    #[test]
    fn on_baseline_samples_have_zero_variance() {
        let mut acc = Accumulator::new(638);
        for _ in 0..1000 {
            acc.record(638);
        }
        let s = acc.finalize().unwrap();
        assert_eq!(s.mean, 638.0);
        assert_eq!(s.variance, 0.0);
        assert_eq!(s.std_dev(), 0.0);
        assert!(s.drift(0.0).is_none());
    }

    #[test]
    fn samples_below_baseline_contribute_squared_deviation() {
        let mut acc = Accumulator::new(100);
        acc.record(90);
        acc.record(110);
        let s = acc.finalize().unwrap();
        assert_eq!(s.mean, 100.0);
        assert_eq!(s.variance, 100.0);
    }

    #[test]
    fn extreme_values_do_not_overflow() {
        let mut acc = Accumulator::new(0);
        for _ in 0..4 {
            acc.record(u64::MAX);
        }
        let s = acc.finalize().unwrap();
        assert_eq!(s.max, u64::MAX);
        assert!(s.mean > 1.8e19);
    }

    #[test]
    fn drift_respects_tolerance() {
        let mut acc = Accumulator::new(1000);
        acc.record(1100);
        let s = acc.finalize().unwrap();

        assert!(s.drift(0.2).is_none());
        let drift = s.drift(0.05).expect("10% off baseline");
        assert_eq!(drift.baseline, 1000);
        assert!((drift.relative - 0.1).abs() < 1e-12);
        assert!(drift.to_string().contains("1000"));
    }

    #[test]
    fn zero_baseline_never_drifts() {
        let mut acc = Accumulator::new(0);
        acc.record(12345);
        assert!(acc.finalize().unwrap().drift(0.0).is_none());
    }
}
