//! Synthetic sessions shared by the unit tests.

use std::ops::Range;

use crate::Params;

/// Marker level between trials.
pub const BASELINE: f64 = -5.0;

/// Marker channel at `BASELINE` with each `(start, stop, code)` plateau filled in.
pub fn marker(len: usize, trials: &[(usize, usize, f64)]) -> Vec<f64> {
    let mut ao = vec![BASELINE; len];
    for &(start, stop, code) in trials {
        ao[start..stop].fill(code);
    }
    ao
}

/// All seven decoder channels for a flying animal; `grounded` ranges hold the
/// tachometer at 0 V.
pub fn session_channels(
    len: usize,
    trials: &[(usize, usize, f64)],
    grounded: &[Range<usize>],
) -> Vec<(String, Vec<f64>)> {
    let mut tach = vec![2.0; len];
    for range in grounded {
        tach[range.clone()].fill(0.0);
    }
    let mut y_stim = vec![0.0; len];
    for &(start, stop, _) in trials {
        for (i, v) in y_stim[start..stop].iter_mut().enumerate() {
            *v = i as f64 / (stop - start) as f64;
        }
    }
    vec![
        ("x_ch".to_string(), vec![0.0; len]),
        ("y_ch".to_string(), y_stim),
        ("wba_l".to_string(), vec![2.0; len]),
        ("wba_r".to_string(), vec![1.0; len]),
        ("patid".to_string(), marker(len, trials)),
        ("vm".to_string(), vec![-50.0; len]),
        ("tach".to_string(), tach),
    ]
}

/// One presentation of each of nine codes 1.0..=9.0 in shuffled order, so that a
/// trial's condition index is its code minus one.
pub fn nine_condition_trials() -> Vec<(usize, usize, f64)> {
    let order = [5.0, 2.0, 8.0, 1.0, 9.0, 3.0, 7.0, 4.0, 6.0];
    order
        .iter()
        .enumerate()
        .map(|(i, &code)| {
            let start = 5_000 + i * 8_000;
            (start, start + 3_000 + (i % 3) * 500, code)
        })
        .collect()
}

/// Defaults with short extraction offsets so synthetic windows stay in bounds.
pub fn test_params() -> Params {
    Params {
        pre_trial_samples: 2_000,
        post_trial_samples: 1_000,
        ..Params::default()
    }
}
