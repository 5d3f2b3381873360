//! Condition discovery from the analog marker level.
//!
//! The stimulus computer encodes each condition as a marker voltage but the
//! code table is not recorded. Each trial's plateau mean (one decimal) is its code;
//! the sorted distinct codes form the catalogue, and a trial's condition is the
//! rank of its code.

use std::collections::BTreeSet;

use ordered_float::OrderedFloat;
use tracing::{debug, warn};

use crate::condition::CONDITION_COUNT;
use crate::signal::mean;
use crate::{ConditionCountPolicy, LoomError, Params, Trial};

/// Beyond this magnitude `10 x` has no fractional precision left; values pass through.
const ROUNDING_LIMIT: f64 = 4.5e14;

/// Round to one decimal place, half away from zero, deciding ties on the exact
/// binary value: 2.25 becomes 2.3 but 0.35 (stored just below) becomes 0.3.
pub fn round_to_tenth(value: f64) -> f64 {
    let magnitude = value.abs();
    if !magnitude.is_finite() || magnitude >= ROUNDING_LIMIT {
        return value;
    }
    // fused multiply-add keeps the sign of `10 x - k` exact
    let mut tenths = (magnitude * 10.0).floor();
    if magnitude.mul_add(10.0, -tenths) < 0.0 {
        tenths -= 1.0;
    } else if magnitude.mul_add(10.0, -(tenths + 1.0)) >= 0.0 {
        tenths += 1.0;
    }
    if magnitude.mul_add(20.0, -(2.0 * tenths + 1.0)) >= 0.0 {
        tenths += 1.0;
    }
    (tenths / 10.0).copysign(value)
}

/// Mean marker level over `[start, stop)`, rounded to one decimal.
pub fn trial_code(marker: &[f64], start: usize, stop: usize) -> Result<f64, LoomError> {
    if start >= stop || stop > marker.len() {
        return Err(LoomError::InvalidParameter(format!(
            "trial window {start}..{stop} outside 0..{}",
            marker.len()
        )));
    }
    let code = round_to_tenth(mean(&marker[start..stop]));
    if !code.is_finite() {
        return Err(LoomError::MalformedMarkerSignal(format!(
            "non-finite marker level in trial {start}..{stop}"
        )));
    }
    Ok(code)
}

/// Distinct codes in ascending order.
pub fn discover_codes(codes: &[f64]) -> Vec<f64> {
    codes
        .iter()
        .map(|&c| OrderedFloat(c))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|c| c.into_inner())
        .collect()
}

/// Position of each code within the ascending catalogue.
pub fn rank_codes(codes: &[f64], catalogue: &[f64]) -> Result<Vec<usize>, LoomError> {
    let keys: Vec<OrderedFloat<f64>> = catalogue.iter().map(|&c| OrderedFloat(c)).collect();
    codes
        .iter()
        .map(|&code| {
            keys.binary_search(&OrderedFloat(code)).map_err(|_| {
                LoomError::InvalidParameter(format!("code {code} missing from catalogue"))
            })
        })
        .collect()
}

/// Assign `code` and `condition` to every trial and return the discovered catalogue.
///
/// Recomputes from the marker on every call, so classifying twice gives the same
/// result.
pub fn classify_trials(
    trials: &mut [Trial],
    marker: &[f64],
    params: &Params,
) -> Result<Vec<f64>, LoomError> {
    let codes = trials
        .iter()
        .map(|t| trial_code(marker, t.start, t.stop))
        .collect::<Result<Vec<_>, _>>()?;
    let catalogue = discover_codes(&codes);
    debug!(codes = ?catalogue, "discovered condition codes");

    if catalogue.len() != CONDITION_COUNT {
        match params.condition_policy {
            ConditionCountPolicy::Strict => {
                return Err(LoomError::UnexpectedConditionCount {
                    expected: CONDITION_COUNT,
                    found: catalogue.len(),
                    codes: catalogue,
                });
            }
            ConditionCountPolicy::Warn => warn!(
                expected = CONDITION_COUNT,
                found = catalogue.len(),
                "unexpected number of condition codes"
            ),
        }
    }

    let ranks = rank_codes(&codes, &catalogue)?;
    for ((trial, code), rank) in trials.iter_mut().zip(codes).zip(ranks) {
        trial.code = Some(code);
        trial.condition = Some(rank);
    }
    Ok(catalogue)
}
