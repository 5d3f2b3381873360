//! Flight validation from the wing-beat tachometer.
//!
//! A grounded animal shows a tachometer near -0.5 V with little envelope; in flight
//! the envelope sits around 4 V. A window counts as flying when the smoothed
//! rectified signal stays above threshold for nearly all of its samples.

use crate::signal::moving_average;
use crate::{LoomError, Params};

#[derive(Clone, Debug)]
pub struct FlightValidator<'a> {
    tach: &'a [f64],
    smooth_samples: usize,
    threshold_v: f64,
    min_fraction: f64,
}

impl<'a> FlightValidator<'a> {
    pub fn new(tach: &'a [f64], params: &Params) -> Self {
        Self {
            tach,
            smooth_samples: params.tach_smooth_samples,
            threshold_v: params.tach_threshold_v,
            min_fraction: params.flying_fraction,
        }
    }

    /// Fraction of samples in `[start, end)` whose smoothed envelope exceeds threshold.
    pub fn flying_fraction(&self, start: usize, end: usize) -> Result<f64, LoomError> {
        if start >= end || end > self.tach.len() {
            return Err(LoomError::InvalidParameter(format!(
                "flight window {start}..{end} outside 0..{}",
                self.tach.len()
            )));
        }
        let envelope = tach_envelope(&self.tach[start..end], self.smooth_samples);
        Ok(fraction_above(&envelope, self.threshold_v))
    }

    pub fn is_flying(&self, start: usize, end: usize) -> Result<bool, LoomError> {
        Ok(self.flying_fraction(start, end)? > self.min_fraction)
    }
}

/// Rectify then smooth a tachometer window.
pub fn tach_envelope(window: &[f64], smooth_samples: usize) -> Vec<f64> {
    let rectified: Vec<f64> = window.iter().map(|v| v.abs()).collect();
    moving_average(&rectified, smooth_samples)
}

/// Share of samples strictly above `threshold`; NaN samples never count.
pub fn fraction_above(values: &[f64], threshold: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let above = values.iter().filter(|&&v| v > threshold).count();
    above as f64 / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// High (1 V) for the first `high` samples then 0 V. With a 1000-sample window the
    /// smoothed value stays above 0.4 V for exactly `high + 100` samples.
    fn step_tach(len: usize, high: usize) -> Vec<f64> {
        (0..len).map(|i| if i < high { -1.0 } else { 0.0 }).collect()
    }

    #[test]
    fn test_fraction_above_threshold() {
        assert_eq!(fraction_above(&[0.5, 0.3, 0.41, f64::NAN], 0.4), 0.5);
        assert_eq!(fraction_above(&[], 0.4), 0.0);
    }

    #[test]
    fn test_ninety_four_percent_is_not_flying() {
        let tach = step_tach(100_000, 93_900);
        let params = Params::default();
        let validator = FlightValidator::new(&tach, &params);
        assert_eq!(validator.flying_fraction(0, tach.len()).unwrap(), 0.94);
        assert!(!validator.is_flying(0, tach.len()).unwrap());
    }

    #[test]
    fn test_ninety_six_percent_is_flying() {
        let tach = step_tach(100_000, 95_900);
        let params = Params::default();
        let validator = FlightValidator::new(&tach, &params);
        assert_eq!(validator.flying_fraction(0, tach.len()).unwrap(), 0.96);
        assert!(validator.is_flying(0, tach.len()).unwrap());
    }

    #[test]
    fn test_validation_is_deterministic() {
        let tach: Vec<f64> = (0..30_000).map(|i| 2.0 * ((i as f64) * 0.01).sin()).collect();
        let params = Params::default();
        let validator = FlightValidator::new(&tach, &params);
        let first = validator.is_flying(1_000, 25_000).unwrap();
        for _ in 0..3 {
            assert_eq!(validator.is_flying(1_000, 25_000).unwrap(), first);
        }
    }

    #[test]
    fn test_invalid_window_is_rejected() {
        let tach = vec![1.0; 100];
        let params = Params::default();
        let validator = FlightValidator::new(&tach, &params);
        assert!(validator.is_flying(50, 50).is_err());
        assert!(validator.is_flying(0, 101).is_err());
    }
}
