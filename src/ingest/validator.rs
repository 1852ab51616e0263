//! Validator/Calibrator: physical bound checks plus derived moisture.
//!
//! `validate` is a pure function of (candidate, timestamp, calibration), so
//! re-validating a candidate against the same calibration state always
//! produces the identical `ValidatedReading`, fault flags included. The
//! backfill relies on this when it revisits rows committed without a
//! calibration.

use chrono::{DateTime, SubsecRound, Utc};

use crate::error::RejectReason;
use crate::models::{Calibration, CandidateReading, ValidatedReading};

// ---

/// Absolute sensor bounds, independent of any calibration.
pub const RH_RANGE: (f64, f64) = (0.0, 100.0);
/// Exclusive on both ends.
pub const TEMP_C_RANGE: (f64, f64) = (-40.0, 85.0);
pub const LUX_RANGE: (f64, f64) = (0.0, 300_000.0);
pub const MOISTURE_RAW_RANGE: (i64, i64) = (0, 1023);

pub const FAULT_BAD_CALIBRATION: &str = "bad-calibration";
pub const FAULT_OUTSIDE_CALIBRATION: &str = "moisture-raw-outside-calibration";

/// Derived moisture fields for one raw value.
#[derive(Debug, Clone, PartialEq)]
pub struct MoistureDerivation {
    // ---
    pub moisture_pct: Option<f64>,
    pub calibration_id: Option<i64>,
    pub faults: Vec<String>,
}

/// The reading's own timestamp, or ingestion time truncated to the second.
pub fn resolve_ts(candidate: &CandidateReading, received_at: DateTime<Utc>) -> DateTime<Utc> {
    // ---
    candidate.ts.unwrap_or_else(|| received_at.trunc_subsecs(0))
}

pub fn validate(
    candidate: &CandidateReading,
    ts: DateTime<Utc>,
    calibration: Option<&Calibration>,
) -> Result<ValidatedReading, RejectReason> {
    // ---
    let moisture_raw = check_moisture_raw(candidate.moisture_raw)?;
    let mut err = candidate.err.clone();

    let lux = within(candidate.lux, "lux", &mut err, |v| {
        v >= LUX_RANGE.0 && v <= LUX_RANGE.1
    });
    let rh = within(candidate.rh, "rh", &mut err, |v| v >= RH_RANGE.0 && v <= RH_RANGE.1);
    let temp_c = within(candidate.temp_c, "temp_c", &mut err, |v| {
        v > TEMP_C_RANGE.0 && v < TEMP_C_RANGE.1
    });

    let derived = derive_moisture(moisture_raw, calibration);
    err.extend(derived.faults);

    Ok(ValidatedReading {
        probe_id: candidate.probe_id,
        ts,
        seq: candidate.seq,
        lux,
        rh,
        temp_c,
        moisture_raw,
        moisture_pct: derived.moisture_pct,
        calibration_id: derived.calibration_id,
        err,
        raw: None,
    })
}

/// Null-out a value that fails its bound and record a soft fault.
fn within(
    value: Option<f64>,
    field: &str,
    faults: &mut Vec<String>,
    in_bounds: impl Fn(f64) -> bool,
) -> Option<f64> {
    // ---
    match value {
        Some(v) if !v.is_finite() || !in_bounds(v) => {
            faults.push(format!("{field}-out-of-range"));
            None
        }
        other => other,
    }
}

fn check_moisture_raw(raw: Option<i64>) -> Result<i32, RejectReason> {
    // ---
    let (lo, hi) = MOISTURE_RAW_RANGE;
    match raw {
        None => Err(RejectReason::InvalidMoistureRaw("moisture_raw is null".into())),
        Some(v) if v < lo || v > hi => Err(RejectReason::InvalidMoistureRaw(format!(
            "{v} outside [{lo}, {hi}]"
        ))),
        // In range, so it fits.
        Some(v) => Ok(v as i32),
    }
}

/// Compute `moisture_pct` for a raw value under an optional calibration.
pub fn derive_moisture(raw: i32, calibration: Option<&Calibration>) -> MoistureDerivation {
    // ---
    let Some(cal) = calibration else {
        return MoistureDerivation {
            moisture_pct: None,
            calibration_id: None,
            faults: Vec::new(),
        };
    };

    let mut faults = Vec::new();
    let moisture_pct = moisture_pct(raw, cal.raw_dry, cal.raw_wet);
    if moisture_pct.is_none() {
        faults.push(FAULT_BAD_CALIBRATION.to_string());
    }

    let below = cal.raw_min.is_some_and(|min| raw < min);
    let above = cal.raw_max.is_some_and(|max| raw > max);
    if below || above {
        faults.push(FAULT_OUTSIDE_CALIBRATION.to_string());
    }

    MoistureDerivation {
        moisture_pct,
        calibration_id: Some(cal.id),
        faults,
    }
}

/// 0 % at the dry anchor, 100 % at the wet anchor, clamped and rounded.
///
/// `None` for a degenerate calibration where both anchors coincide.
pub fn moisture_pct(raw: i32, raw_dry: i32, raw_wet: i32) -> Option<f64> {
    // ---
    let span = f64::from(raw_dry) - f64::from(raw_wet);
    if span == 0.0 {
        return None;
    }
    let pct = (100.0 * (f64::from(raw_dry) - f64::from(raw)) / span).round();
    Some(pct.clamp(0.0, 100.0))
}
