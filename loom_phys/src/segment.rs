//! Trial boundary detection on the stimulus marker channel.
//!
//! The marker jumps up when a looming stimulus starts and drops back when it ends.
//! Glitches re-trigger edges, recordings can begin mid-trial or end before the
//! last stop, and the animal may stop flying. Boundaries are cleaned in stages:
//! edge candidates, redundancy removal, a stop guard, reconciliation of the
//! leading and trailing edges, and finally flight validation.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::flight::FlightValidator;
use crate::{LoomError, Params, Trial};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentDiagnostics {
    pub raw_starts: usize,
    pub raw_stops: usize,
    pub clean_starts: usize,
    pub clean_stops: usize,
    pub guarded_stops: usize,
    pub dropped_leading_stop: bool,
    pub dropped_trailing_start: bool,
    pub paired: usize,
    pub non_flight: Vec<(usize, usize)>,
}

#[derive(Clone, Debug)]
pub struct Segmentation {
    pub trials: Vec<Trial>,
    pub diagnostics: SegmentDiagnostics,
}

/// `out[i] = x[i + 1] - x[i]`.
pub fn first_difference(x: &[f64]) -> Vec<f64> {
    x.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Difference indices of rising (`> start_edge`) and falling (`<= stop_edge`) edges.
pub fn edge_candidates(diff: &[f64], start_edge: f64, stop_edge: f64) -> (Vec<usize>, Vec<usize>) {
    let mut starts = Vec::new();
    let mut stops = Vec::new();
    for (i, &d) in diff.iter().enumerate() {
        if d > start_edge {
            starts.push(i);
        } else if d <= stop_edge {
            stops.push(i);
        }
    }
    (starts, stops)
}

/// Drop every candidate followed by another within `min_gap` samples, so a burst
/// collapses onto its last edge, then move survivors to the first post-edge sample.
pub fn drop_redundant(candidates: &[usize], min_gap: usize) -> Vec<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|&(i, &c)| match candidates.get(i + 1) {
            Some(&next) => next - c >= min_gap,
            None => true,
        })
        .map(|(_, &c)| c + 1)
        .collect()
}

/// Keep stops whose marker sample at `stop + offset` is positive. Guard samples
/// outside the recording reject the stop.
pub fn guard_stops(stops: &[usize], marker: &[f64], offset: i64) -> Vec<usize> {
    stops
        .iter()
        .copied()
        .filter(|&stop| {
            let guard_at = stop as i64 + offset;
            guard_at >= 0
                && marker
                    .get(guard_at as usize)
                    .map_or(false, |&value| value > 0.0)
        })
        .collect()
}

/// Pair cleaned starts and stops after discarding a stop that precedes the first
/// start and a start that follows the last stop.
pub fn reconcile(
    mut starts: Vec<usize>,
    mut stops: Vec<usize>,
    diagnostics: &mut SegmentDiagnostics,
) -> Result<Vec<(usize, usize)>, LoomError> {
    if starts.is_empty() || stops.is_empty() {
        return Err(LoomError::MalformedMarkerSignal(format!(
            "no usable edges ({} starts, {} stops)",
            starts.len(),
            stops.len()
        )));
    }

    if stops[0] < starts[0] {
        stops.remove(0);
        diagnostics.dropped_leading_stop = true;
    }
    if let (Some(&last_start), Some(&last_stop)) = (starts.last(), stops.last()) {
        if last_start > last_stop {
            starts.pop();
            diagnostics.dropped_trailing_start = true;
        }
    }

    if starts.len() != stops.len() {
        return Err(LoomError::MalformedMarkerSignal(format!(
            "{} trial starts but {} trial stops after reconciliation",
            starts.len(),
            stops.len()
        )));
    }
    if starts.is_empty() {
        return Err(LoomError::MalformedMarkerSignal(
            "no complete trial after reconciliation".into(),
        ));
    }

    let pairs: Vec<(usize, usize)> = starts.into_iter().zip(stops).collect();
    for (i, &(start, stop)) in pairs.iter().enumerate() {
        if start >= stop {
            return Err(LoomError::MalformedMarkerSignal(format!(
                "trial {i} stops at {stop} before it starts at {start}"
            )));
        }
        if let Some(&(next_start, _)) = pairs.get(i + 1) {
            if next_start < stop {
                return Err(LoomError::MalformedMarkerSignal(format!(
                    "trial {i} ({start}..{stop}) overlaps the next start at {next_start}"
                )));
            }
        }
    }
    Ok(pairs)
}

/// Cleaned trial boundaries before flight validation.
pub fn trial_bounds(
    marker: &[f64],
    params: &Params,
    diagnostics: &mut SegmentDiagnostics,
) -> Result<Vec<(usize, usize)>, LoomError> {
    let diff = first_difference(marker);
    let (raw_starts, raw_stops) = edge_candidates(&diff, params.start_edge_v, params.stop_edge_v);
    diagnostics.raw_starts = raw_starts.len();
    diagnostics.raw_stops = raw_stops.len();

    let starts = drop_redundant(&raw_starts, params.redundant_gap_samples);
    let stops = drop_redundant(&raw_stops, params.redundant_gap_samples);
    diagnostics.clean_starts = starts.len();
    diagnostics.clean_stops = stops.len();

    let stops = guard_stops(&stops, marker, params.stop_guard_offset);
    diagnostics.guarded_stops = stops.len();
    debug!(
        raw_starts = diagnostics.raw_starts,
        raw_stops = diagnostics.raw_stops,
        starts = diagnostics.clean_starts,
        stops = diagnostics.guarded_stops,
        "marker edges"
    );

    let pairs = reconcile(starts, stops, diagnostics)?;
    diagnostics.paired = pairs.len();
    Ok(pairs)
}

/// Segment a marker channel into flight-validated, contiguously numbered trials.
pub fn segment_trials(marker: &[f64], tach: &[f64], params: &Params) -> Result<Segmentation, LoomError> {
    if marker.len() != tach.len() {
        return Err(LoomError::ChannelShapeMismatch {
            channel: "tach".into(),
            expected: marker.len(),
            found: tach.len(),
        });
    }
    let mut diagnostics = SegmentDiagnostics::default();
    let pairs = trial_bounds(marker, params, &mut diagnostics)?;

    let validator = FlightValidator::new(tach, params);
    let margin = params.flight_margin_samples;
    let mut trials = Vec::with_capacity(pairs.len());
    for (start, stop) in pairs {
        let window_start = start.saturating_sub(margin);
        let window_end = stop.saturating_add(margin).min(tach.len());
        if validator.is_flying(window_start, window_end)? {
            trials.push(Trial::new(trials.len(), start, stop));
        } else {
            diagnostics.non_flight.push((start, stop));
        }
    }

    if !diagnostics.non_flight.is_empty() {
        warn!(
            dropped = diagnostics.non_flight.len(),
            kept = trials.len(),
            "dropped non-flight trials"
        );
    }
    Ok(Segmentation { trials, diagnostics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{marker, BASELINE};

    fn bounds(marker: &[f64]) -> Result<Vec<(usize, usize)>, LoomError> {
        trial_bounds(marker, &Params::default(), &mut SegmentDiagnostics::default())
    }

    #[test]
    fn test_redundant_starts_collapse_to_later_edge() {
        assert_eq!(drop_redundant(&[1_000, 1_500], 1_000), vec![1_501]);
        assert_eq!(drop_redundant(&[1_000, 2_000], 1_000), vec![1_001, 2_001]);
        assert!(drop_redundant(&[], 1_000).is_empty());
    }

    #[test]
    fn test_glitch_start_500_samples_early() {
        let mut ao = marker(20_000, &[(1_500, 6_000, 2.0)]);
        // single-sample spike 500 samples before the true onset
        ao[1_000] = 7.0;
        let pairs = bounds(&ao).unwrap();
        assert_eq!(pairs, vec![(1_500, 6_000)]);
    }

    #[test]
    fn test_recovers_known_boundaries() {
        let trials = [(2_000, 6_000, 3.0), (9_000, 14_000, 1.0), (16_000, 18_500, 2.0)];
        let ao = marker(25_000, &trials);
        let pairs = bounds(&ao).unwrap();
        let expected: Vec<(usize, usize)> = trials.iter().map(|&(s, e, _)| (s, e)).collect();
        assert_eq!(pairs, expected);
    }

    #[test]
    fn test_truncated_first_and_last_trials_are_dropped() {
        let mut ao = marker(30_000, &[(5_000, 9_000, 2.0), (12_000, 16_000, 3.0)]);
        // recording starts inside a trial and ends inside another
        ao[..800].fill(4.0);
        ao[25_000..].fill(1.0);
        let mut diagnostics = SegmentDiagnostics::default();
        let pairs = trial_bounds(&ao, &Params::default(), &mut diagnostics).unwrap();
        assert_eq!(pairs, vec![(5_000, 9_000), (12_000, 16_000)]);
        assert!(diagnostics.dropped_leading_stop);
        assert!(diagnostics.dropped_trailing_start);
    }

    #[test]
    fn test_stop_guard_rejects_noise_drop() {
        let mut ao = marker(20_000, &[(2_000, 8_000, 2.0)]);
        // a negative excursion on the baseline produces a falling edge out of trial
        ao[12_000] = -10.0;
        let guarded = guard_stops(&[8_000, 12_000], &ao, -5);
        assert_eq!(guarded, vec![8_000]);
        assert_eq!(bounds(&ao).unwrap(), vec![(2_000, 8_000)]);
        assert!(guard_stops(&[3], &ao, -5).is_empty());
    }

    #[test]
    fn test_count_mismatch_is_malformed() {
        let mut ao = vec![BASELINE; 10_000];
        ao[1_000..3_000].fill(6.0);
        ao[3_000..5_000].fill(1.5);
        let err = bounds(&ao).unwrap_err();
        assert!(matches!(err, LoomError::MalformedMarkerSignal(_)));
    }

    #[test]
    fn test_overlapping_trials_are_malformed() {
        // two rising steps more than 1000 samples apart, then two falling steps
        let mut ao = vec![BASELINE; 6_000];
        ao[1_000..2_100].fill(2.0);
        ao[2_100..3_000].fill(9.0);
        ao[3_000..4_000].fill(4.0);
        match bounds(&ao) {
            Err(LoomError::MalformedMarkerSignal(msg)) => {
                assert!(msg.contains("overlaps"), "{msg}");
                assert!(msg.contains("1000..3000"), "{msg}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_stop_before_start_is_malformed() {
        let mut diagnostics = SegmentDiagnostics::default();
        let err = reconcile(vec![5_000, 9_000], vec![1_000, 3_000, 12_000], &mut diagnostics)
            .unwrap_err();
        assert!(diagnostics.dropped_leading_stop);
        match err {
            LoomError::MalformedMarkerSignal(msg) => assert!(msg.contains("before it starts"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_flight_window_is_clamped_to_recording() {
        let ao = marker(20_000, &[(2_000, 6_000, 3.0), (10_000, 14_000, 1.0)]);
        let tach = vec![2.0; 20_000];
        let params = Params {
            flight_margin_samples: usize::MAX,
            ..Params::default()
        };
        let seg = segment_trials(&ao, &tach, &params).unwrap();
        assert_eq!(seg.trials.len(), 2);
    }

    #[test]
    fn test_flat_marker_is_malformed() {
        let ao = vec![BASELINE; 10_000];
        assert!(matches!(bounds(&ao), Err(LoomError::MalformedMarkerSignal(_))));
    }

    #[test]
    fn test_non_flight_trial_is_removed_and_renumbered() {
        let trials = [(2_000, 6_000, 3.0), (10_000, 14_000, 1.0), (18_000, 22_000, 2.0)];
        let ao = marker(30_000, &trials);
        let mut tach = vec![2.0; 30_000];
        tach[9_000..15_000].fill(-0.1);
        let seg = segment_trials(&ao, &tach, &Params::default()).unwrap();
        assert_eq!(seg.trials.len(), 2);
        assert_eq!(seg.trials[0].index, 0);
        assert_eq!(seg.trials[1].index, 1);
        assert_eq!(seg.trials[1].start, 18_000);
        assert_eq!(seg.diagnostics.non_flight, vec![(10_000, 14_000)]);
    }

    #[test]
    fn test_trials_are_ordered_and_disjoint() {
        let trials: Vec<(usize, usize, f64)> = (0..12)
            .map(|i| (3_000 + i * 7_000, 3_000 + i * 7_000 + 3_500 + (i % 3) * 500, (i % 4) as f64 + 1.0))
            .collect();
        let ao = marker(100_000, &trials);
        let tach = vec![2.0; 100_000];
        let seg = segment_trials(&ao, &tach, &Params::default()).unwrap();
        assert_eq!(seg.trials.len(), 12);
        for pair in seg.trials.windows(2) {
            assert!(pair[0].start < pair[0].stop);
            assert!(pair[0].stop <= pair[1].start);
        }
    }

    #[test]
    fn test_tach_length_must_match() {
        let ao = marker(10_000, &[(2_000, 4_000, 1.0)]);
        let tach = vec![2.0; 9_000];
        assert!(matches!(
            segment_trials(&ao, &tach, &Params::default()),
            Err(LoomError::ChannelShapeMismatch { .. })
        ));
    }
}
