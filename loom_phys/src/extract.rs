//! Per-trial trace windows and the multi-subject collection they are merged into.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::signal::nan_mean;
use crate::{LoomError, Params, Recording, SubjectId, Trial};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TraceChannel {
    Lmr,
    Lwa,
    Rwa,
    Vm,
    YStim,
}

impl TraceChannel {
    pub const ALL: [TraceChannel; 5] = [
        TraceChannel::Lmr,
        TraceChannel::Lwa,
        TraceChannel::Rwa,
        TraceChannel::Vm,
        TraceChannel::YStim,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TraceChannel::Lmr => "lmr",
            TraceChannel::Lwa => "lwa",
            TraceChannel::Rwa => "rwa",
            TraceChannel::Vm => "vm",
            TraceChannel::YStim => "ystim",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        TraceChannel::ALL.into_iter().find(|ch| ch.name() == lower)
    }

    fn source<'a>(&self, recording: &'a Recording) -> &'a [f64] {
        match self {
            TraceChannel::Lmr => &recording.lmr,
            TraceChannel::Lwa => &recording.lwa,
            TraceChannel::Rwa => &recording.rwa,
            TraceChannel::Vm => &recording.vm,
            TraceChannel::YStim => &recording.y_stim,
        }
    }
}

impl fmt::Display for TraceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceKey {
    pub subject: SubjectId,
    pub trial: usize,
    pub condition: usize,
    pub channel: TraceChannel,
}

/// Every trace channel of one trial, aligned so that sample `pre_samples` is the
/// trial start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceBundle {
    pub subject: SubjectId,
    pub trial: usize,
    pub condition: usize,
    /// Recording index of the first sample; negative when the window starts before
    /// the recording (those samples are NaN).
    pub window_start: i64,
    pub pre_samples: usize,
    pub trial_samples: usize,
    pub traces: BTreeMap<TraceChannel, Vec<f64>>,
}

impl TraceBundle {
    pub fn trace(&self, channel: TraceChannel) -> Option<&[f64]> {
        self.traces.get(&channel).map(Vec::as_slice)
    }

    pub fn key(&self, channel: TraceChannel) -> TraceKey {
        TraceKey {
            subject: self.subject.clone(),
            trial: self.trial,
            condition: self.condition,
            channel,
        }
    }

    pub fn len(&self) -> usize {
        self.traces.values().next().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The channel minus its NaN-mean over `baseline` (bundle-relative samples).
    pub fn baseline_subtracted(&self, channel: TraceChannel, baseline: Range<usize>) -> Option<Vec<f64>> {
        let trace = self.trace(channel)?;
        let end = baseline.end.min(trace.len());
        let start = baseline.start.min(end);
        let base = nan_mean(&trace[start..end]);
        Some(trace.iter().map(|v| v - base).collect())
    }
}

/// Longest bundle `extract_bundles` will allocate per channel.
pub const MAX_BUNDLE_SAMPLES: usize = 3 * crate::MAX_WINDOW_SAMPLES;

/// Copy `len` samples starting at `start`, padding with NaN outside `data`.
pub fn slice_padded(data: &[f64], start: i64, len: usize) -> Vec<f64> {
    (0..len as i64)
        .map(|offset| {
            let idx = start + offset;
            if idx < 0 {
                f64::NAN
            } else {
                data.get(idx as usize).copied().unwrap_or(f64::NAN)
            }
        })
        .collect()
}

/// Cut one bundle per classified trial, spanning
/// `[start - pre_trial_samples, stop + post_trial_samples)`.
pub fn extract_bundles(
    subject: &SubjectId,
    recording: &Recording,
    trials: &[Trial],
    params: &Params,
) -> Result<Vec<TraceBundle>, LoomError> {
    let pre = params.pre_trial_samples;
    let post = params.post_trial_samples;
    trials
        .iter()
        .map(|trial| {
            let condition = trial.condition.ok_or_else(|| {
                LoomError::InvalidParameter(format!(
                    "trial {} of {subject} has no condition",
                    trial.index
                ))
            })?;
            let len = pre
                .checked_add(trial.len())
                .and_then(|n| n.checked_add(post))
                .filter(|&n| n <= MAX_BUNDLE_SAMPLES)
                .ok_or_else(|| {
                    LoomError::InvalidParameter(format!(
                        "extraction window of trial {} exceeds {MAX_BUNDLE_SAMPLES} samples",
                        trial.index
                    ))
                })?;
            let window_start = trial.start as i64 - pre as i64;
            let traces = TraceChannel::ALL
                .into_iter()
                .map(|ch| (ch, slice_padded(ch.source(recording), window_start, len)))
                .collect();
            Ok(TraceBundle {
                subject: subject.clone(),
                trial: trial.index,
                condition,
                window_start,
                pre_samples: pre,
                trial_samples: trial.len(),
                traces,
            })
        })
        .collect()
}

/// Append-only collection of bundles from any number of subjects.
///
/// Serialized as the plain bundle list; deserializing re-appends every bundle so
/// the duplicate index is rebuilt and colliding input is rejected.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<TraceBundle>", into = "Vec<TraceBundle>")]
pub struct TraceCollection {
    bundles: Vec<TraceBundle>,
    seen: HashSet<(SubjectId, usize)>,
}

impl TryFrom<Vec<TraceBundle>> for TraceCollection {
    type Error = LoomError;

    fn try_from(bundles: Vec<TraceBundle>) -> Result<Self, Self::Error> {
        let mut collection = TraceCollection::new();
        collection.append(bundles)?;
        Ok(collection)
    }
}

impl From<TraceCollection> for Vec<TraceBundle> {
    fn from(collection: TraceCollection) -> Self {
        collection.bundles
    }
}

impl TraceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch of bundles. Nothing is added if any (subject, trial) pair is
    /// already present or repeated within the batch.
    pub fn append(&mut self, bundles: Vec<TraceBundle>) -> Result<(), LoomError> {
        let mut incoming = HashSet::with_capacity(bundles.len());
        for bundle in &bundles {
            let id = (bundle.subject.clone(), bundle.trial);
            if self.seen.contains(&id) || !incoming.insert(id) {
                return Err(LoomError::DuplicateTraceKey(format!(
                    "{} trial {}",
                    bundle.subject, bundle.trial
                )));
            }
        }
        self.seen.extend(incoming);
        self.bundles.extend(bundles);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn bundles(&self) -> &[TraceBundle] {
        &self.bundles
    }

    pub fn get(&self, key: &TraceKey) -> Option<&[f64]> {
        self.bundles
            .iter()
            .find(|b| b.subject == key.subject && b.trial == key.trial && b.condition == key.condition)
            .and_then(|b| b.trace(key.channel))
    }

    /// Bundles matching an optional group and condition, in insertion order.
    pub fn select<'a>(
        &'a self,
        group: Option<&'a str>,
        condition: Option<usize>,
    ) -> impl Iterator<Item = &'a TraceBundle> + 'a {
        self.bundles.iter().filter(move |b| {
            group.map_or(true, |g| b.subject.group == g)
                && condition.map_or(true, |c| b.condition == c)
        })
    }

    /// Distinct groups in first-seen order.
    pub fn groups(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for bundle in &self.bundles {
            if !out.contains(&bundle.subject.group) {
                out.push(bundle.subject.group.clone());
            }
        }
        out
    }

    /// Sorted distinct condition indices, optionally within one group.
    pub fn conditions(&self, group: Option<&str>) -> Vec<usize> {
        let mut out: Vec<usize> = self.select(group, None).map(|b| b.condition).collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}
