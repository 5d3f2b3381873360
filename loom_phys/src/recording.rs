use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::signal::{condition_wing, DropoutSpan};
use crate::{LoomError, Params};

/// Acquisition channels, named as the recording decoder reports them.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    XStim,
    YStim,
    WingLeft,
    WingRight,
    Marker,
    Vm,
    Tach,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::XStim,
        Channel::YStim,
        Channel::WingLeft,
        Channel::WingRight,
        Channel::Marker,
        Channel::Vm,
        Channel::Tach,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::XStim => "x_ch",
            Channel::YStim => "y_ch",
            Channel::WingLeft => "wba_l",
            Channel::WingRight => "wba_r",
            Channel::Marker => "patid",
            Channel::Vm => "vm",
            Channel::Tach => "tach",
        }
    }

    /// Case-insensitive lookup by decoder name.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        Channel::ALL.into_iter().find(|ch| ch.name() == lower)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One subject's session after exclusion and conditioning.
#[derive(Clone, Debug)]
pub struct Recording {
    pub x_stim: Vec<f64>,
    pub y_stim: Vec<f64>,
    /// Left wing angle in degrees.
    pub lwa: Vec<f64>,
    /// Right wing angle in degrees.
    pub rwa: Vec<f64>,
    /// Left minus right wing angle.
    pub lmr: Vec<f64>,
    pub marker: Vec<f64>,
    /// Membrane voltage with the bridge offset removed.
    pub vm: Vec<f64>,
    pub tach: Vec<f64>,
    pub n_excluded: usize,
    pub dropouts_left: Vec<DropoutSpan>,
    pub dropouts_right: Vec<DropoutSpan>,
}

impl Recording {
    /// Build a recording from decoder output.
    ///
    /// Every required channel must be present with the same length as `x_ch`.
    /// Excluded indices (out-of-range ones are ignored) are removed from all
    /// channels before the wing signals are conditioned.
    pub fn from_named_channels<I, S>(
        channels: I,
        exclude: &[usize],
        params: &Params,
    ) -> Result<Self, LoomError>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: AsRef<str>,
    {
        let mut by_channel: HashMap<Channel, Vec<f64>> = HashMap::new();
        for (name, samples) in channels {
            let name = name.as_ref();
            match Channel::from_name(name) {
                Some(ch) => {
                    if by_channel.insert(ch, samples).is_some() {
                        return Err(LoomError::InvalidParameter(format!(
                            "channel {ch} supplied more than once"
                        )));
                    }
                }
                None => debug!(channel = name, "ignoring unused channel"),
            }
        }

        let mut take = |ch: Channel| {
            by_channel
                .remove(&ch)
                .ok_or_else(|| LoomError::MissingChannel(ch.name().to_string()))
        };
        let x_stim = take(Channel::XStim)?;
        let y_stim = take(Channel::YStim)?;
        let wing_left = take(Channel::WingLeft)?;
        let wing_right = take(Channel::WingRight)?;
        let marker = take(Channel::Marker)?;
        let vm = take(Channel::Vm)?;
        let tach = take(Channel::Tach)?;

        let expected = x_stim.len();
        for (ch, samples) in [
            (Channel::YStim, &y_stim),
            (Channel::WingLeft, &wing_left),
            (Channel::WingRight, &wing_right),
            (Channel::Marker, &marker),
            (Channel::Vm, &vm),
            (Channel::Tach, &tach),
        ] {
            if samples.len() != expected {
                return Err(LoomError::ChannelShapeMismatch {
                    channel: ch.name().to_string(),
                    expected,
                    found: samples.len(),
                });
            }
        }

        let keep = keep_mask(expected, exclude);
        let n_excluded = expected - keep.iter().filter(|&&k| k).count();
        if n_excluded == expected {
            return Err(LoomError::EmptyRecording);
        }
        let apply = |samples: Vec<f64>| -> Vec<f64> {
            if n_excluded == 0 {
                return samples;
            }
            samples
                .into_iter()
                .zip(keep.iter())
                .filter_map(|(v, &k)| k.then_some(v))
                .collect()
        };

        let left = condition_wing(&apply(wing_left), params);
        let right = condition_wing(&apply(wing_right), params);
        let lmr = left
            .degrees
            .iter()
            .zip(right.degrees.iter())
            .map(|(l, r)| l - r)
            .collect();
        let vm = apply(vm)
            .into_iter()
            .map(|v| v - params.vm_offset_mv)
            .collect();

        Ok(Self {
            x_stim: apply(x_stim),
            y_stim: apply(y_stim),
            lwa: left.degrees,
            rwa: right.degrees,
            lmr,
            marker: apply(marker),
            vm,
            tach: apply(tach),
            n_excluded,
            dropouts_left: left.dropouts,
            dropouts_right: right.dropouts,
        })
    }

    pub fn len(&self) -> usize {
        self.marker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marker.is_empty()
    }

    pub fn duration_s(&self) -> f64 {
        self.len() as f64 / crate::SAMPLE_RATE_HZ
    }
}

fn keep_mask(len: usize, exclude: &[usize]) -> Vec<bool> {
    let mut keep = vec![true; len];
    for &idx in exclude {
        if let Some(slot) = keep.get_mut(idx) {
            *slot = false;
        }
    }
    keep
}
