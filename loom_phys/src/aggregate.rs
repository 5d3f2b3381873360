//! Population numerics over a trace collection: mean traces per group and
//! condition, the membrane voltage / turning correlation, and time-resolved
//! histograms of a channel.

use std::collections::BTreeMap;
use std::ops::Range;

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::debug;

use crate::condition::{conditions_with_speed, Speed};
use crate::signal::nan_mean;
use crate::{
    condition_labels, LoomError, SubjectId, TraceBundle, TraceChannel, TraceCollection,
    SAMPLE_RATE_HZ,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubjectMean {
    pub subject: SubjectId,
    pub n_trials: usize,
    pub mean: Vec<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConditionSummary {
    pub group: String,
    pub condition: usize,
    pub label: Option<String>,
    pub channel: TraceChannel,
    pub n_subjects: usize,
    pub n_trials: usize,
    /// Per-sample NaN-mean over every trial of the group.
    pub mean: Vec<f64>,
    pub subject_means: Vec<SubjectMean>,
}

/// Trials-by-samples matrix of one channel. Shorter trials are NaN padded on the
/// right; with `baseline` each row has its own baseline NaN-mean removed.
pub fn trial_matrix(
    bundles: &[&TraceBundle],
    channel: TraceChannel,
    baseline: Option<&Range<usize>>,
) -> Array2<f64> {
    let rows: Vec<Vec<f64>> = bundles
        .iter()
        .filter_map(|b| match baseline {
            Some(range) => b.baseline_subtracted(channel, range.clone()),
            None => b.trace(channel).map(<[f64]>::to_vec),
        })
        .collect();
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);

    let mut matrix = Array2::from_elem((rows.len(), width), f64::NAN);
    for (mut dst, src) in matrix.axis_iter_mut(Axis(0)).zip(rows.iter()) {
        for (d, &s) in dst.iter_mut().zip(src.iter()) {
            *d = s;
        }
    }
    matrix
}

/// NaN-ignoring mean of every column.
pub fn column_nan_mean(matrix: &Array2<f64>) -> Array1<f64> {
    matrix.axis_iter(Axis(1)).map(|col| nan_mean(col.iter())).collect()
}

pub fn summarize_condition(
    collection: &TraceCollection,
    group: &str,
    condition: usize,
    channel: TraceChannel,
    baseline: Option<&Range<usize>>,
) -> Option<ConditionSummary> {
    let bundles: Vec<&TraceBundle> = collection.select(Some(group), Some(condition)).collect();
    if bundles.is_empty() {
        return None;
    }

    let mut by_subject: BTreeMap<&SubjectId, Vec<&TraceBundle>> = BTreeMap::new();
    for &bundle in &bundles {
        by_subject.entry(&bundle.subject).or_default().push(bundle);
    }
    let subject_means = by_subject
        .into_iter()
        .map(|(subject, trials)| SubjectMean {
            subject: subject.clone(),
            n_trials: trials.len(),
            mean: column_nan_mean(&trial_matrix(&trials, channel, baseline)).to_vec(),
        })
        .collect::<Vec<_>>();

    let matrix = trial_matrix(&bundles, channel, baseline);
    debug!(
        group,
        condition,
        channel = channel.name(),
        trials = matrix.nrows(),
        samples = matrix.ncols(),
        "condition matrix"
    );

    Some(ConditionSummary {
        group: group.to_string(),
        condition,
        label: condition_labels().get(condition).map(|l| l.to_string()),
        channel,
        n_subjects: subject_means.len(),
        n_trials: matrix.nrows(),
        mean: column_nan_mean(&matrix).to_vec(),
        subject_means,
    })
}

/// Summaries for every group (first-seen order) and every condition present in it.
pub fn summarize_all(
    collection: &TraceCollection,
    channel: TraceChannel,
    baseline: Option<&Range<usize>>,
) -> Vec<ConditionSummary> {
    let mut out = Vec::new();
    for group in collection.groups() {
        out.extend(
            collection
                .conditions(Some(group.as_str()))
                .into_iter()
                .filter_map(|c| summarize_condition(collection, &group, c, channel, baseline)),
        );
    }
    out
}

/// Windows for the voltage / turning correlation, in bundle-relative samples.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelationOptions {
    /// Per-trial voltage baseline.
    pub baseline: Range<usize>,
    /// Where the turn is measured as |mean lmr|.
    pub turn_window: Range<usize>,
    /// Width of each sliding voltage window.
    pub vm_window: usize,
    pub step: usize,
    /// Sliding windows start at `0, step, 2 step, ..` below this sample.
    pub span: usize,
}

impl CorrelationOptions {
    /// Turn windows per expansion rate, assuming the default 25000-sample
    /// pre-trial offset.
    pub fn for_speed(speed: Speed) -> Self {
        let turn_window = match speed {
            Speed::Slow => 24_500..28_000,
            Speed::Medium => 29_500..33_000,
            Speed::Fast => 38_500..42_000,
        };
        Self {
            baseline: 0..5_000,
            turn_window,
            vm_window: 10_000,
            step: 1_000,
            span: 39_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrelationPoint {
    /// Centre of the voltage window, seconds from bundle start.
    pub center_s: f64,
    pub n_trials: usize,
    pub r: f64,
    pub p: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmTurnCorrelation {
    pub group: Option<String>,
    pub condition: usize,
    pub label: Option<String>,
    pub n_trials: usize,
    pub points: Vec<CorrelationPoint>,
}

/// Pearson r with its two-sided p-value from Student's t on n - 2 degrees of
/// freedom. `None` below three pairs or when either side has no variance.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<(f64, f64)> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom.is_nan() || denom <= 0.0 {
        return None;
    }

    let r = (cov / denom).clamp(-1.0, 1.0);
    let df = (n - 2) as f64;
    let p = if r.abs() >= 1.0 {
        0.0
    } else {
        let t = r * (df / (1.0 - r * r)).sqrt();
        let dist = StudentsT::new(0.0, 1.0, df).ok()?;
        (2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0)
    };
    Some((r, p))
}

fn window_nan_mean(trace: &[f64], window: Range<usize>) -> f64 {
    let end = window.end.min(trace.len());
    let start = window.start.min(end);
    nan_mean(&trace[start..end])
}

/// Correlate the baseline-relative voltage in each sliding window with the turn
/// magnitude, across the trials of one condition. Windows where the correlation is
/// undefined are skipped.
pub fn vm_turn_correlation(
    collection: &TraceCollection,
    group: Option<&str>,
    condition: usize,
    options: &CorrelationOptions,
) -> Option<VmTurnCorrelation> {
    let trials: Vec<(&[f64], f64, f64)> = collection
        .select(group, Some(condition))
        .filter_map(|b| {
            let vm = b.trace(TraceChannel::Vm)?;
            let lmr = b.trace(TraceChannel::Lmr)?;
            let base = window_nan_mean(vm, options.baseline.clone());
            let turn = window_nan_mean(lmr, options.turn_window.clone()).abs();
            Some((vm, base, turn))
        })
        .collect();
    if trials.is_empty() {
        return None;
    }

    let points = (0..options.span)
        .step_by(options.step.max(1))
        .filter_map(|start| {
            let window = start..start.saturating_add(options.vm_window);
            let (delta, turn): (Vec<f64>, Vec<f64>) = trials
                .iter()
                .map(|&(vm, base, turn)| (window_nan_mean(vm, window.clone()) - base, turn))
                .filter(|(d, t)| d.is_finite() && t.is_finite())
                .unzip();
            let (r, p) = pearson(&delta, &turn)?;
            Some(CorrelationPoint {
                center_s: (start as f64 + options.vm_window as f64 / 2.0) / SAMPLE_RATE_HZ,
                n_trials: delta.len(),
                r,
                p,
            })
        })
        .collect();

    Some(VmTurnCorrelation {
        group: group.map(str::to_string),
        condition,
        label: condition_labels().get(condition).map(|l| l.to_string()),
        n_trials: trials.len(),
        points,
    })
}

/// Correlations for the left, center and right conditions of one expansion rate.
pub fn vm_turn_correlation_by_speed(
    collection: &TraceCollection,
    group: Option<&str>,
    speed: Speed,
) -> Vec<VmTurnCorrelation> {
    let options = CorrelationOptions::for_speed(speed);
    conditions_with_speed(speed)
        .into_iter()
        .filter_map(|c| vm_turn_correlation(collection, group, c, &options))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistogramOptions {
    pub baseline: Range<usize>,
    pub time_bins: usize,
    pub value_bins: usize,
    /// Bundle-relative sample range binned along time.
    pub time_range: (f64, f64),
    pub value_range: (f64, f64),
}

impl Default for HistogramOptions {
    fn default() -> Self {
        Self {
            baseline: 200..700,
            time_bins: 200,
            value_bins: 50,
            time_range: (0.0, 4_200.0),
            value_range: (-3.0, 3.0),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimeHistogram {
    pub group: String,
    pub condition: usize,
    pub channel: TraceChannel,
    pub n_trials: usize,
    /// Samples that fell inside both ranges.
    pub n_samples: usize,
    pub time_edges: Vec<f64>,
    pub value_edges: Vec<f64>,
    /// Time bins by value bins, normalised so the density integrates to one.
    pub density: Array2<f64>,
}

fn edges(range: (f64, f64), bins: usize) -> Vec<f64> {
    let width = (range.1 - range.0) / bins as f64;
    (0..=bins).map(|i| range.0 + i as f64 * width).collect()
}

/// Uniform bin of `x`; the upper edge belongs to the last bin.
fn bin_index(x: f64, range: (f64, f64), bins: usize) -> Option<usize> {
    if x.is_nan() || x < range.0 || x > range.1 {
        return None;
    }
    let idx = ((x - range.0) / (range.1 - range.0) * bins as f64) as usize;
    Some(idx.min(bins - 1))
}

/// Two-dimensional density of (sample index, baseline-subtracted value) over every
/// trial of a group and condition.
pub fn time_histogram(
    collection: &TraceCollection,
    group: &str,
    condition: usize,
    channel: TraceChannel,
    options: &HistogramOptions,
) -> Result<Option<TimeHistogram>, LoomError> {
    let (t_lo, t_hi) = options.time_range;
    let (v_lo, v_hi) = options.value_range;
    if options.time_bins == 0 || options.value_bins == 0 {
        return Err(LoomError::InvalidParameter(
            "histogram needs at least one bin".into(),
        ));
    }
    let increasing = |lo: f64, hi: f64| lo.is_finite() && hi.is_finite() && hi > lo;
    if !increasing(t_lo, t_hi) || !increasing(v_lo, v_hi) {
        return Err(LoomError::InvalidParameter(
            "histogram ranges must be finite and increasing".into(),
        ));
    }

    let bundles: Vec<&TraceBundle> = collection.select(Some(group), Some(condition)).collect();
    let matrix = trial_matrix(&bundles, channel, Some(&options.baseline));
    if matrix.nrows() == 0 {
        return Ok(None);
    }

    let mut counts = Array2::<f64>::zeros((options.time_bins, options.value_bins));
    let mut total = 0usize;
    for ((_, col), &value) in matrix.indexed_iter() {
        let (Some(ti), Some(vi)) = (
            bin_index(col as f64, options.time_range, options.time_bins),
            bin_index(value, options.value_range, options.value_bins),
        ) else {
            continue;
        };
        counts[[ti, vi]] += 1.0;
        total += 1;
    }
    if total > 0 {
        let area = (t_hi - t_lo) / options.time_bins as f64 * (v_hi - v_lo)
            / options.value_bins as f64;
        counts /= total as f64 * area;
    }

    Ok(Some(TimeHistogram {
        group: group.to_string(),
        condition,
        channel,
        n_trials: matrix.nrows(),
        n_samples: total,
        time_edges: edges(options.time_range, options.time_bins),
        value_edges: edges(options.value_range, options.value_bins),
        density: counts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(group: &str, name: &str, trial: usize, condition: usize, lmr: Vec<f64>) -> TraceBundle {
        let mut traces = BTreeMap::new();
        traces.insert(TraceChannel::Lmr, lmr);
        TraceBundle {
            subject: SubjectId::new(group, name),
            trial,
            condition,
            window_start: 0,
            pre_samples: 2,
            trial_samples: 2,
            traces,
        }
    }

    fn collection() -> TraceCollection {
        let mut c = TraceCollection::new();
        c.append(vec![
            bundle("wt", "a", 0, 0, vec![1.0, 1.0, 3.0, 5.0]),
            bundle("wt", "a", 1, 0, vec![3.0, 3.0, 5.0]),
            bundle("wt", "a", 2, 4, vec![0.0, 0.0, 0.0, 0.0]),
        ])
        .unwrap();
        c.append(vec![bundle("wt", "b", 0, 0, vec![2.0, f64::NAN, 8.0, 2.0])])
            .unwrap();
        c.append(vec![bundle("kir", "c", 0, 0, vec![9.0, 9.0, 9.0, 9.0])])
            .unwrap();
        c
    }

    #[test]
    fn test_trial_matrix_pads_short_trials() {
        let c = collection();
        let bundles: Vec<&TraceBundle> = c.select(Some("wt"), Some(0)).collect();
        let m = trial_matrix(&bundles, TraceChannel::Lmr, None);
        assert_eq!(m.dim(), (3, 4));
        assert_eq!(m[[1, 2]], 5.0);
        assert!(m[[1, 3]].is_nan());
        assert!(trial_matrix(&bundles, TraceChannel::Vm, None).is_empty());
    }

    #[test]
    fn test_population_and_subject_means() {
        let c = collection();
        let s = summarize_condition(&c, "wt", 0, TraceChannel::Lmr, None).unwrap();
        assert_eq!(s.n_trials, 3);
        assert_eq!(s.n_subjects, 2);
        assert_eq!(s.label.as_deref(), Some("left, 22 l/v"));
        assert_eq!(s.mean[0], 2.0);
        assert_eq!(s.mean[1], 2.0);
        assert_eq!(s.mean[3], 3.5);

        let a = &s.subject_means[0];
        assert_eq!(a.subject.name, "a");
        assert_eq!(a.n_trials, 2);
        assert_eq!(a.mean, vec![2.0, 2.0, 4.0, 5.0]);
        assert!(s.subject_means[1].mean[1].is_nan());
    }

    #[test]
    fn test_baseline_is_removed_per_trial() {
        let c = collection();
        let s = summarize_condition(&c, "wt", 0, TraceChannel::Lmr, Some(&(0..2))).unwrap();
        // rows become [0,0,2,4], [0,0,2,NaN], [0,NaN,6,0]
        assert_eq!(s.mean[0], 0.0);
        assert_eq!(s.mean[2], 10.0 / 3.0);
        assert_eq!(s.mean[3], 2.0);
    }

    fn vm_lmr_bundle(
        name: &str,
        trial: usize,
        condition: usize,
        vm: Vec<f64>,
        lmr: Vec<f64>,
    ) -> TraceBundle {
        let mut b = bundle("wt", name, trial, condition, lmr);
        b.traces.insert(TraceChannel::Vm, vm);
        b
    }

    #[test]
    fn test_pearson_matches_reference_values() {
        let (r, p) = pearson(&[1.0, 2.0, 3.0, 4.0, 5.0], &[2.0, 1.0, 4.0, 3.0, 5.0]).unwrap();
        assert!((r - 0.8).abs() < 1e-12);
        assert!((p - 0.104_088).abs() < 1e-4, "p = {p}");

        let (r, p) = pearson(&[1.0, 2.0, 3.0], &[-2.0, -4.0, -6.0]).unwrap();
        assert_eq!(r, -1.0);
        assert_eq!(p, 0.0);

        assert!(pearson(&[1.0, 2.0], &[1.0, 2.0]).is_none());
        assert!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn test_vm_turn_correlation_tracks_turn_size() {
        let mut c = TraceCollection::new();
        let bundles = (1..=4)
            .map(|k| {
                let k = k as f64;
                vm_lmr_bundle(
                    "a",
                    k as usize,
                    2,
                    vec![0.0, 0.0, 0.0, 0.0, k, k],
                    vec![0.0, 0.0, -k, -k, 0.0, 0.0],
                )
            })
            .collect();
        c.append(bundles).unwrap();
        let options = CorrelationOptions {
            baseline: 0..2,
            turn_window: 2..4,
            vm_window: 2,
            step: 2,
            span: 6,
        };
        let corr = vm_turn_correlation(&c, Some("wt"), 2, &options).unwrap();
        assert_eq!(corr.n_trials, 4);
        assert_eq!(corr.label.as_deref(), Some("left, 88 l/v"));
        // the first two windows carry no voltage change and are undefined
        assert_eq!(corr.points.len(), 1);
        let point = &corr.points[0];
        assert_eq!(point.center_s, 5.0 / SAMPLE_RATE_HZ);
        assert_eq!(point.n_trials, 4);
        assert!((point.r - 1.0).abs() < 1e-12);
        assert!(point.p < 1e-6);

        assert!(vm_turn_correlation(&c, Some("wt"), 3, &options).is_none());
    }

    #[test]
    fn test_correlation_by_speed_uses_matching_conditions() {
        let mut c = TraceCollection::new();
        c.append(
            [0usize, 1, 3, 6]
                .iter()
                .map(|&cond| vm_lmr_bundle("a", cond, cond, vec![0.0; 4], vec![0.0; 4]))
                .collect(),
        )
        .unwrap();
        let found: Vec<usize> = vm_turn_correlation_by_speed(&c, None, Speed::Slow)
            .iter()
            .map(|corr| corr.condition)
            .collect();
        assert_eq!(found, vec![0, 3, 6]);
        assert_eq!(CorrelationOptions::for_speed(Speed::Fast).turn_window, 38_500..42_000);
    }

    #[test]
    fn test_time_histogram_density() {
        let mut c = TraceCollection::new();
        c.append(vec![
            bundle("wt", "a", 0, 1, vec![0.0, 1.0, 1.0, 1.0]),
            bundle("wt", "a", 1, 1, vec![0.0, -1.0, -1.0, 10.0]),
        ])
        .unwrap();
        let options = HistogramOptions {
            baseline: 0..1,
            time_bins: 2,
            value_bins: 2,
            time_range: (0.0, 4.0),
            value_range: (-2.0, 2.0),
        };
        let h = time_histogram(&c, "wt", 1, TraceChannel::Lmr, &options)
            .unwrap()
            .unwrap();
        assert_eq!(h.n_trials, 2);
        // 10.0 lies outside the value range
        assert_eq!(h.n_samples, 7);
        assert_eq!(h.time_edges, vec![0.0, 2.0, 4.0]);
        assert_eq!(h.value_edges, vec![-2.0, 0.0, 2.0]);
        assert_eq!(h.density[[0, 0]], 1.0 / 28.0);
        assert_eq!(h.density[[0, 1]], 3.0 / 28.0);
        assert_eq!(h.density[[1, 0]], 1.0 / 28.0);
        assert_eq!(h.density[[1, 1]], 2.0 / 28.0);
        let integral: f64 = h.density.iter().sum::<f64>() * 4.0;
        assert!((integral - 1.0).abs() < 1e-12);

        assert!(time_histogram(&c, "wt", 5, TraceChannel::Lmr, &options)
            .unwrap()
            .is_none());
        let bad = HistogramOptions {
            value_bins: 0,
            ..options
        };
        assert!(time_histogram(&c, "wt", 1, TraceChannel::Lmr, &bad).is_err());
    }

    #[test]
    fn test_summarize_all_covers_groups_and_conditions() {
        let c = collection();
        assert_eq!(c.conditions(Some("kir")), vec![0]);
        assert_eq!(c.conditions(None), vec![0, 4]);
        let all = summarize_all(&c, TraceChannel::Lmr, None);
        let keys: Vec<(&str, usize)> = all.iter().map(|s| (s.group.as_str(), s.condition)).collect();
        assert_eq!(keys, vec![("wt", 0), ("wt", 4), ("kir", 0)]);
        assert!(summarize_condition(&c, "kir", 4, TraceChannel::Lmr, None).is_none());
    }
}
