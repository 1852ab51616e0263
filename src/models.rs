//! Data models for the probe telemetry pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Canonical text form of every timestamp the pipeline emits.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a device or query timestamp as UTC, truncated to the second.
///
/// Accepts `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` and RFC 3339.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    // ---
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).trunc_subsecs(0));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc().trunc_subsecs(0))
}

/// Serde adapter writing timestamps as `YYYY-MM-DD HH:MM:SS`.
pub mod canonical_ts {
    // ---
    use super::{parse_timestamp, TS_FORMAT};
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&ts.format(TS_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(d)?;
        parse_timestamp(&text).ok_or_else(|| D::Error::custom(format!("bad timestamp '{text}'")))
    }

    pub mod option {
        // ---
        use super::super::{parse_timestamp, TS_FORMAT};
        use chrono::{DateTime, Utc};
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.collect_str(&ts.format(TS_FORMAT)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(text) => parse_timestamp(&text)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("bad timestamp '{text}'"))),
                None => Ok(None),
            }
        }
    }
}

/// A decoded line that has not been range-checked or calibrated yet.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateReading {
    // ---
    pub probe_id: i64,
    pub ts: Option<DateTime<Utc>>,
    pub seq: Option<i64>,
    pub lux: Option<f64>,
    pub rh: Option<f64>,
    pub temp_c: Option<f64>,
    /// Present-but-null is kept as `None` so the validator can reject it.
    pub moisture_raw: Option<i64>,
    /// Fault codes reported by the device itself.
    pub err: Vec<String>,
}

/// A reading that passed validation and is ready for the dedup writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedReading {
    // ---
    pub probe_id: i64,
    #[serde(with = "canonical_ts")]
    pub ts: DateTime<Utc>,
    pub seq: Option<i64>,
    pub lux: Option<f64>,
    pub rh: Option<f64>,
    pub temp_c: Option<f64>,
    pub moisture_raw: i32,
    pub moisture_pct: Option<f64>,
    pub calibration_id: Option<i64>,
    pub err: Vec<String>,
    /// Source line as received, kept next to the parsed fields.
    #[serde(skip_serializing)]
    pub raw: Option<String>,
}

impl ValidatedReading {
    // ---
    /// `err` as stored in the log: comma-joined, `None` when clean.
    pub fn err_text(&self) -> Option<String> {
        join_faults(&self.err)
    }

    pub fn with_raw(mut self, line: &[u8]) -> Self {
        self.raw = Some(String::from_utf8_lossy(line).trim().to_string());
        self
    }
}

pub fn join_faults(faults: &[String]) -> Option<String> {
    // ---
    if faults.is_empty() {
        None
    } else {
        Some(faults.join(","))
    }
}

/// A committed row of the readings log.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub id: i64,
    #[serde(skip_serializing)]
    pub rev: i64,
    pub probe_id: i64,
    #[serde(with = "canonical_ts")]
    pub ts: DateTime<Utc>,
    pub seq: Option<i64>,
    pub lux: Option<f64>,
    pub rh: Option<f64>,
    pub temp_c: Option<f64>,
    pub moisture_raw: i32,
    pub moisture_pct: Option<f64>,
    pub calibration_id: Option<i64>,
    pub err: Option<String>,
    #[serde(skip_serializing)]
    pub raw: Option<String>,
}

impl Reading {
    // ---
    pub fn has_fault(&self) -> bool {
        self.err.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Result of a dedup-guarded insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted(i64),
    Duplicate,
}

/// A hard-rejected line kept for later analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    // ---
    pub received_at: DateTime<Utc>,
    pub line: String,
    pub reason: String,
    pub detail: Option<String>,
}

/// Derived moisture fields written by the validator or the backfill.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    // ---
    pub moisture_pct: Option<f64>,
    pub calibration_id: Option<i64>,
    pub err: Option<String>,
}

/// Per-probe mapping from raw ADC counts to moisture percentage.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Calibration {
    // ---
    pub id: i64,
    pub probe_id: i64,
    pub raw_dry: i32,
    pub raw_wet: i32,
    pub raw_min: Option<i32>,
    pub raw_max: Option<i32>,
    #[serde(with = "canonical_ts")]
    pub valid_from: DateTime<Utc>,
    #[serde(with = "canonical_ts::option")]
    pub valid_to: Option<DateTime<Utc>>,
}

impl Calibration {
    // ---
    pub fn is_active_at(&self, ts: DateTime<Utc>) -> bool {
        self.valid_from <= ts && self.valid_to.map_or(true, |end| ts < end)
    }
}

/// Inclusive alert bounds for one metric; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    // ---
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Limits {
    // ---
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Alert thresholds configured for one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeThresholds {
    // ---
    pub probe_id: i64,
    pub lux: Limits,
    pub rh: Limits,
    pub temp_c: Limits,
    pub moisture_pct: Limits,
    pub sustain_minutes: i64,
}

impl ProbeThresholds {
    // ---
    pub const DEFAULT_SUSTAIN_MINUTES: i64 = 30;

    pub fn new(probe_id: i64) -> Self {
        Self {
            probe_id,
            lux: Limits::default(),
            rh: Limits::default(),
            temp_c: Limits::default(),
            moisture_pct: Limits::default(),
            sustain_minutes: Self::DEFAULT_SUSTAIN_MINUTES,
        }
    }
}

/// Identity of one rollup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    // ---
    pub probe_id: i64,
    pub bucket_start: DateTime<Utc>,
}

/// Aggregate of one probe's readings over one fixed-width window.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RollupBucket {
    // ---
    pub probe_id: i64,
    #[serde(with = "canonical_ts")]
    pub bucket_start: DateTime<Utc>,
    pub width_secs: i64,
    #[sqlx(rename = "row_count")]
    pub count: i64,
    pub lux_avg: Option<f64>,
    pub lux_min: Option<f64>,
    pub lux_max: Option<f64>,
    pub rh_avg: Option<f64>,
    pub rh_min: Option<f64>,
    pub rh_max: Option<f64>,
    pub temp_c_avg: Option<f64>,
    pub temp_c_min: Option<f64>,
    pub temp_c_max: Option<f64>,
    pub moisture_pct_avg: Option<f64>,
    pub moisture_pct_min: Option<f64>,
    pub moisture_pct_max: Option<f64>,
    pub moisture_raw_avg: Option<f64>,
    pub moisture_raw_min: Option<f64>,
    pub moisture_raw_max: Option<f64>,
    pub err_count: i64,
    #[serde(with = "canonical_ts")]
    pub updated_at: DateTime<Utc>,
}

impl RollupBucket {
    // ---
    pub fn key(&self) -> BucketKey {
        BucketKey {
            probe_id: self.probe_id,
            bucket_start: self.bucket_start,
        }
    }
}

/// Persisted progress of one rollup consumer.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RollupCursor {
    // ---
    pub name: String,
    /// Buckets ending at or before this instant are final.
    #[serde(with = "canonical_ts::option")]
    pub last_cutoff: Option<DateTime<Utc>>,
    /// Highest log revision already folded.
    pub last_rev: i64,
    #[serde(with = "canonical_ts::option")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl RollupCursor {
    // ---
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_cutoff: None,
            last_rev: 0,
            last_run_at: None,
        }
    }
}

/// Alert rules known to the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    TooDry,
    TooWet,
    LuxOutOfRange,
    TempOutOfRange,
    RhOutOfRange,
    MoistureLowSustain,
    MoistureHighSustain,
}

impl RuleId {
    // ---
    pub const ALL: [RuleId; 7] = [
        RuleId::TooDry,
        RuleId::TooWet,
        RuleId::LuxOutOfRange,
        RuleId::TempOutOfRange,
        RuleId::RhOutOfRange,
        RuleId::MoistureLowSustain,
        RuleId::MoistureHighSustain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::TooDry => "too_dry",
            RuleId::TooWet => "too_wet",
            RuleId::LuxOutOfRange => "lux_out_of_range",
            RuleId::TempOutOfRange => "temp_out_of_range",
            RuleId::RhOutOfRange => "rh_out_of_range",
            RuleId::MoistureLowSustain => "moisture_low_sustain",
            RuleId::MoistureHighSustain => "moisture_high_sustain",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleId::ALL
            .into_iter()
            .find(|rule| rule.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown alert rule '{s}'"))
    }
}

/// State of one rule for one probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleState {
    // ---
    pub open: bool,
    /// Start of the current uninterrupted breach (sustained rules only).
    #[serde(with = "canonical_ts::option", default)]
    pub breach_since: Option<DateTime<Utc>>,
    pub last_value: Option<f64>,
    #[serde(with = "canonical_ts::option", default)]
    pub changed_at: Option<DateTime<Utc>>,
}

/// Current alert state of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSnapshot {
    // ---
    pub probe_id: i64,
    pub rules: BTreeMap<RuleId, RuleState>,
    #[serde(with = "canonical_ts")]
    pub updated_at: DateTime<Utc>,
}

impl AlertSnapshot {
    // ---
    pub fn empty(probe_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            probe_id,
            rules: BTreeMap::new(),
            updated_at: now,
        }
    }

    pub fn is_open(&self, rule: RuleId) -> bool {
        self.rules.get(&rule).is_some_and(|state| state.open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Open,
    Clear,
}

impl Transition {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Open => "open",
            Transition::Clear => "clear",
        }
    }
}

impl FromStr for Transition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Transition::Open),
            "clear" => Ok(Transition::Clear),
            other => Err(anyhow::anyhow!("unknown alert transition '{other}'")),
        }
    }
}

/// Immutable record of one alert opening or clearing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    // ---
    pub event_id: Uuid,
    pub probe_id: i64,
    pub rule: RuleId,
    pub transition: Transition,
    pub value: Option<f64>,
    /// Timestamp of the reading that caused the transition.
    #[serde(with = "canonical_ts")]
    pub ts: DateTime<Utc>,
    #[serde(with = "canonical_ts")]
    pub recorded_at: DateTime<Utc>,
}

impl AlertEvent {
    // ---
    /// Keyed by the committed reading that caused the transition, so a
    /// replay of the same row yields the same id while distinct rows sharing
    /// a timestamp never collide.
    pub fn event_id_for(probe_id: i64, reading_id: i64, rule: RuleId, transition: Transition) -> Uuid {
        let name = format!("{probe_id}/{reading_id}/{rule}/{}", transition.as_str());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}
