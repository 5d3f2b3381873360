//! Trial segmentation and condition classification for looming flight physiology recordings.

pub mod aggregate;
pub mod classify;
pub mod condition;
pub mod extract;
pub mod flight;
pub mod recording;
pub mod segment;
pub mod signal;

#[cfg(test)]
mod testutil;

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use condition::{condition_for_index, condition_labels, Condition, Direction, Speed, CONDITION_COUNT};
pub use extract::{TraceBundle, TraceChannel, TraceCollection, TraceKey};
pub use recording::{Channel, Recording};
pub use segment::SegmentDiagnostics;
pub use signal::{moving_average, DropoutSpan};

/// Acquisition rate of every channel.
pub const SAMPLE_RATE_HZ: f64 = 10_000.0;

/// Upper bound for every window, gap and offset parameter (ten minutes of samples).
pub const MAX_WINDOW_SAMPLES: usize = 6_000_000;

#[derive(Error, Debug)]
pub enum LoomError {
    #[error("missing channel: {0}")]
    MissingChannel(String),
    #[error("channel {channel} has {found} samples, expected {expected}")]
    ChannelShapeMismatch {
        channel: String,
        expected: usize,
        found: usize,
    },
    #[error("recording has no samples left after exclusion")]
    EmptyRecording,
    #[error("malformed marker signal: {0}")]
    MalformedMarkerSignal(String),
    #[error("expected {expected} distinct condition codes, found {found}: {codes:?}")]
    UnexpectedConditionCount {
        expected: usize,
        found: usize,
        codes: Vec<f64>,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("duplicate trace key: {0}")]
    DuplicateTraceKey(String),
}

impl LoomError {
    /// Short stable name used when logging and reporting per-subject failures.
    pub fn kind(&self) -> &'static str {
        match self {
            LoomError::MissingChannel(_) => "missing_channel",
            LoomError::ChannelShapeMismatch { .. } => "channel_shape_mismatch",
            LoomError::EmptyRecording => "empty_recording",
            LoomError::MalformedMarkerSignal(_) => "malformed_marker_signal",
            LoomError::UnexpectedConditionCount { .. } => "unexpected_condition_count",
            LoomError::InvalidParameter(_) => "invalid_parameter",
            LoomError::DuplicateTraceKey(_) => "duplicate_trace_key",
        }
    }
}

/// What to do with wing samples inside a detected dropout span.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BridgePolicy {
    /// Report spans but leave the converted samples as recorded.
    Keep,
    /// Overwrite each span, widened by `bridge_margin`, with NaN.
    Nullify,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        BridgePolicy::Keep
    }
}

/// Reaction to a discovered code catalogue whose size differs from the condition grid.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionCountPolicy {
    Strict,
    Warn,
}

impl Default for ConditionCountPolicy {
    fn default() -> Self {
        ConditionCountPolicy::Strict
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub latency_shift_samples: usize,
    pub wing_offset_deg: f64,
    pub wing_gain_deg_per_volt: f64,
    pub artifact_jump_deg: f64,
    pub artifact_gap_samples: usize,
    pub bridge_policy: BridgePolicy,
    pub bridge_margin: usize,
    pub vm_offset_mv: f64,
    pub tach_smooth_samples: usize,
    pub tach_threshold_v: f64,
    pub flying_fraction: f64,
    pub start_edge_v: f64,
    pub stop_edge_v: f64,
    pub redundant_gap_samples: usize,
    pub stop_guard_offset: i64,
    pub flight_margin_samples: usize,
    pub pre_trial_samples: usize,
    pub post_trial_samples: usize,
    pub condition_policy: ConditionCountPolicy,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            latency_shift_samples: 12,
            wing_offset_deg: -45.0,
            wing_gain_deg_per_volt: 33.75,
            artifact_jump_deg: 30.0,
            artifact_gap_samples: 2_000,
            bridge_policy: BridgePolicy::Keep,
            bridge_margin: 2,
            vm_offset_mv: 13.0,
            tach_smooth_samples: 1_000,
            tach_threshold_v: 0.4,
            flying_fraction: 0.95,
            start_edge_v: 5.0,
            stop_edge_v: -4.0,
            redundant_gap_samples: 1_000,
            stop_guard_offset: -5,
            flight_margin_samples: 750,
            pre_trial_samples: 25_000,
            post_trial_samples: 10_000,
            condition_policy: ConditionCountPolicy::Strict,
        }
    }
}

impl Params {
    /// Parse a JSON object of overrides; omitted fields keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, LoomError> {
        let params: Params =
            serde_json::from_str(text).map_err(|e| LoomError::InvalidParameter(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), LoomError> {
        let finite = [
            ("wing_offset_deg", self.wing_offset_deg),
            ("wing_gain_deg_per_volt", self.wing_gain_deg_per_volt),
            ("artifact_jump_deg", self.artifact_jump_deg),
            ("vm_offset_mv", self.vm_offset_mv),
            ("tach_threshold_v", self.tach_threshold_v),
            ("start_edge_v", self.start_edge_v),
            ("stop_edge_v", self.stop_edge_v),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(LoomError::InvalidParameter(format!("{name} must be finite")));
            }
        }
        if self.wing_gain_deg_per_volt == 0.0 {
            return Err(LoomError::InvalidParameter(
                "wing_gain_deg_per_volt must be non-zero".into(),
            ));
        }
        if self.artifact_jump_deg <= 0.0 {
            return Err(LoomError::InvalidParameter("artifact_jump_deg must be > 0".into()));
        }
        if self.tach_smooth_samples == 0 {
            return Err(LoomError::InvalidParameter("tach_smooth_samples must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.flying_fraction) {
            return Err(LoomError::InvalidParameter(
                "flying_fraction must lie in [0, 1]".into(),
            ));
        }
        if self.start_edge_v <= 0.0 {
            return Err(LoomError::InvalidParameter("start_edge_v must be > 0".into()));
        }
        if self.stop_edge_v >= 0.0 {
            return Err(LoomError::InvalidParameter("stop_edge_v must be < 0".into()));
        }
        if self.redundant_gap_samples == 0 {
            return Err(LoomError::InvalidParameter(
                "redundant_gap_samples must be > 0".into(),
            ));
        }
        let windows = [
            ("latency_shift_samples", self.latency_shift_samples),
            ("artifact_gap_samples", self.artifact_gap_samples),
            ("bridge_margin", self.bridge_margin),
            ("tach_smooth_samples", self.tach_smooth_samples),
            ("redundant_gap_samples", self.redundant_gap_samples),
            ("stop_guard_offset", self.stop_guard_offset.unsigned_abs() as usize),
            ("flight_margin_samples", self.flight_margin_samples),
            ("pre_trial_samples", self.pre_trial_samples),
            ("post_trial_samples", self.post_trial_samples),
        ];
        for (name, value) in windows {
            if value > MAX_WINDOW_SAMPLES {
                return Err(LoomError::InvalidParameter(format!(
                    "{name} must be at most {MAX_WINDOW_SAMPLES} samples"
                )));
            }
        }
        Ok(())
    }
}

/// Identity of one recorded animal; `group` is typically the genotype and may be empty.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId {
    pub group: String,
    pub name: String,
}

impl SubjectId {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.group, self.name)
        }
    }
}

/// One stimulus presentation. `stop` is the first sample after the marker plateau.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Trial {
    pub index: usize,
    pub start: usize,
    pub stop: usize,
    pub code: Option<f64>,
    pub condition: Option<usize>,
}

impl Trial {
    pub fn new(index: usize, start: usize, stop: usize) -> Self {
        Self {
            index,
            start,
            stop,
            code: None,
            condition: None,
        }
    }

    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    pub fn duration_s(&self) -> f64 {
        self.len() as f64 / SAMPLE_RATE_HZ
    }

    pub fn label(&self) -> Option<&'static str> {
        self.condition
            .and_then(|idx| condition_labels().get(idx).copied())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Ok,
    /// Every trial failed flight validation; the result is valid but carries no trials.
    NoFlightTrials,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubjectResult {
    pub subject: SubjectId,
    pub status: SubjectStatus,
    pub n_samples: usize,
    pub n_excluded: usize,
    pub trials: Vec<Trial>,
    pub catalogue: Vec<f64>,
    pub segmentation: SegmentDiagnostics,
    pub dropouts_left: Vec<DropoutSpan>,
    pub dropouts_right: Vec<DropoutSpan>,
}

/// Per-subject output before it is merged into a batch.
#[derive(Clone, Debug)]
pub struct SubjectAnalysis {
    pub result: SubjectResult,
    pub bundles: Vec<TraceBundle>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubjectFailure {
    pub subject: SubjectId,
    pub kind: String,
    pub message: String,
}

/// Raw named channels for one subject, as handed over by a recording decoder.
#[derive(Clone, Debug, Default)]
pub struct RecordingInput {
    pub subject: SubjectId,
    pub channels: Vec<(String, Vec<f64>)>,
    pub exclude: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct BatchResult {
    pub subjects: Vec<SubjectResult>,
    pub failures: Vec<SubjectFailure>,
    pub traces: TraceCollection,
}

/// Run the full pipeline for one subject: condition, segment, validate flight,
/// classify, and extract aligned traces.
pub fn process_recording(
    input: RecordingInput,
    params: &Params,
) -> Result<SubjectAnalysis, LoomError> {
    params.validate()?;
    let RecordingInput {
        subject,
        channels,
        exclude,
    } = input;

    let recording = Recording::from_named_channels(channels, &exclude, params)?;
    debug!(
        subject = %subject,
        samples = recording.len(),
        excluded = recording.n_excluded,
        "recording loaded"
    );

    let segmentation = segment::segment_trials(&recording.marker, &recording.tach, params)?;
    let mut trials = segmentation.trials;

    let (status, catalogue, bundles) = if trials.is_empty() {
        info!(subject = %subject, "no flight trials retained");
        (SubjectStatus::NoFlightTrials, Vec::new(), Vec::new())
    } else {
        let catalogue = classify::classify_trials(&mut trials, &recording.marker, params)?;
        let bundles = extract::extract_bundles(&subject, &recording, &trials, params)?;
        (SubjectStatus::Ok, catalogue, bundles)
    };

    info!(
        subject = %subject,
        trials = trials.len(),
        conditions = catalogue.len(),
        "subject processed"
    );

    Ok(SubjectAnalysis {
        result: SubjectResult {
            subject,
            status,
            n_samples: recording.len(),
            n_excluded: recording.n_excluded,
            trials,
            catalogue,
            segmentation: segmentation.diagnostics,
            dropouts_left: recording.dropouts_left.clone(),
            dropouts_right: recording.dropouts_right.clone(),
        },
        bundles,
    })
}

/// Process many subjects in parallel. Failures are logged and reported per subject;
/// successful subjects are appended to one trace collection in input order.
pub fn process_batch(inputs: Vec<RecordingInput>, params: &Params) -> Result<BatchResult, LoomError> {
    params.validate()?;

    let outcomes: Vec<Result<SubjectAnalysis, SubjectFailure>> = inputs
        .into_par_iter()
        .map(|input| {
            let subject = input.subject.clone();
            process_recording(input, params).map_err(|err| failure(subject, &err))
        })
        .collect();

    let mut batch = BatchResult::default();
    for outcome in outcomes {
        match outcome {
            Ok(analysis) => {
                if let Err(err) = batch.traces.append(analysis.bundles) {
                    batch.failures.push(failure(analysis.result.subject, &err));
                    continue;
                }
                batch.subjects.push(analysis.result);
            }
            Err(fail) => batch.failures.push(fail),
        }
    }

    info!(
        subjects = batch.subjects.len(),
        failures = batch.failures.len(),
        bundles = batch.traces.len(),
        "batch complete"
    );
    Ok(batch)
}

fn failure(subject: SubjectId, err: &LoomError) -> SubjectFailure {
    warn!(subject = %subject, kind = err.kind(), "subject excluded: {}", err);
    SubjectFailure {
        subject,
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}
