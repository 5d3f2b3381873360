//! Wing-angle conditioning and the shared moving-average primitive.
//!
//! Wing channels arrive as volts delayed by the acquisition chain. Conditioning
//! shifts them back in time, maps volts to degrees, and locates dropout events
//! (bursts of implausible sample-to-sample jumps).

use std::iter;

use serde::{Deserialize, Serialize};

use crate::{BridgePolicy, Params};

/// Half-open sample range `[start, end)` covering one wing-signal dropout.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropoutSpan {
    pub start: usize,
    pub end: usize,
}

impl DropoutSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Clone, Debug)]
pub struct ConditionedWing {
    pub degrees: Vec<f64>,
    pub dropouts: Vec<DropoutSpan>,
}

/// Centered moving average with the same length as `values`.
///
/// Odd windows are widened by one. Each edge is padded with `window / 2` copies of
/// the mean of the nearest half-window of real samples, so a constant input is
/// returned unchanged. Non-finite samples only poison the windows containing them.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    if n == 0 || window == 0 {
        return values.to_vec();
    }
    let window = if window % 2 == 1 { window + 1 } else { window };
    let half = window / 2;

    let head = mean(&values[..half.min(n)]);
    let tail = mean(&values[n.saturating_sub(half)..]);

    let padded = iter::repeat(head)
        .take(half)
        .chain(values.iter().copied())
        .chain(iter::repeat(tail).take(half));

    let mut sums = Vec::with_capacity(n + window + 1);
    let mut bad = Vec::with_capacity(n + window + 1);
    let (mut sum, mut count) = (0.0_f64, 0usize);
    sums.push(sum);
    bad.push(count);
    for v in padded {
        if v.is_finite() {
            sum += v;
        } else {
            count += 1;
        }
        sums.push(sum);
        bad.push(count);
    }

    let width = window as f64;
    (0..n)
        .map(|k| {
            if bad[k + window] > bad[k] {
                f64::NAN
            } else {
                (sums[k + window] - sums[k]) / width
            }
        })
        .collect()
}

/// Arithmetic mean; NaN for an empty slice or when any sample is NaN.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Mean over the finite samples only; NaN when none are finite.
pub fn nan_mean<'a, I>(values: I) -> f64
where
    I: IntoIterator<Item = &'a f64>,
{
    let (sum, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Move every sample `shift` positions earlier; the vacated tail is NaN.
pub fn shift_earlier(raw: &[f64], shift: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; raw.len()];
    if shift < raw.len() {
        out[..raw.len() - shift].copy_from_slice(&raw[shift..]);
    }
    out
}

pub fn volts_to_degrees(volts: f64, offset_deg: f64, gain_deg_per_volt: f64) -> f64 {
    offset_deg + volts * gain_deg_per_volt
}

/// Locate dropout spans in a converted wing signal.
///
/// A sample is flagged one position ahead of every first difference whose
/// magnitude exceeds `jump_deg`. Consecutive flags closer than `max_gap` bound a
/// single dropout; overlapping or touching bounds are merged.
pub fn detect_dropouts(degrees: &[f64], jump_deg: f64, max_gap: usize) -> Vec<DropoutSpan> {
    let flagged: Vec<usize> = degrees
        .windows(2)
        .enumerate()
        .filter(|(_, w)| (w[1] - w[0]).abs() > jump_deg)
        .map(|(i, _)| i.saturating_sub(1))
        .collect();

    let mut spans: Vec<DropoutSpan> = Vec::new();
    for pair in flagged.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if end <= start || end - start >= max_gap {
            continue;
        }
        match spans.last_mut() {
            Some(last) if start <= last.end => last.end = last.end.max(end),
            _ => spans.push(DropoutSpan { start, end }),
        }
    }
    spans
}

/// Overwrite each span, widened by `margin` on both sides, with NaN.
pub fn nullify_spans(degrees: &mut [f64], spans: &[DropoutSpan], margin: usize) {
    let n = degrees.len();
    for span in spans {
        let start = span.start.saturating_sub(margin).min(n);
        let end = (span.end + margin).min(n);
        degrees[start..end].fill(f64::NAN);
    }
}

/// Turn one raw wing channel (volts) into a latency-corrected angle in degrees.
pub fn condition_wing(raw: &[f64], params: &Params) -> ConditionedWing {
    let mut degrees: Vec<f64> = shift_earlier(raw, params.latency_shift_samples)
        .into_iter()
        .map(|v| volts_to_degrees(v, params.wing_offset_deg, params.wing_gain_deg_per_volt))
        .collect();

    let dropouts = detect_dropouts(
        &degrees,
        params.artifact_jump_deg,
        params.artifact_gap_samples,
    );
    if params.bridge_policy == BridgePolicy::Nullify {
        nullify_spans(&mut degrees, &dropouts, params.bridge_margin);
    }

    ConditionedWing { degrees, dropouts }
}
