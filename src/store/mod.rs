//! Storage boundary of the pipeline.
//!
//! The readings log is the single source of truth; rollup buckets and alert
//! snapshots are derived caches that can be rebuilt from it. Each concern is
//! a separate trait so the pipeline stages only see what they use.
//! `PgStore` is the production implementation, `MemoryStore` backs tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    AlertEvent, AlertSnapshot, BucketKey, Calibration, DeadLetter, Derived, ProbeThresholds,
    Reading, RollupBucket, RollupCursor, ValidatedReading, WriteOutcome,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// Time-range filter shared by the read paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeQuery {
    // ---
    pub probe_id: Option<i64>,
    /// Inclusive.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive.
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
    pub oldest_first: bool,
}

impl RangeQuery {
    // ---
    pub fn matches(&self, probe_id: i64, ts: DateTime<Utc>) -> bool {
        self.probe_id.map_or(true, |p| p == probe_id)
            && self.start.map_or(true, |s| ts >= s)
            && self.end.map_or(true, |e| ts <= e)
    }
}

/// Parameters of one dirty-bucket scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirtyScan {
    // ---
    pub width_secs: i64,
    pub last_rev: i64,
    pub last_cutoff: Option<DateTime<Utc>>,
    pub cutoff: DateTime<Utc>,
}

impl DirtyScan {
    // ---
    /// Whether a row at `rev` makes the bucket starting at `bucket_start` dirty.
    ///
    /// Only final buckets (ending at or before `cutoff`) qualify; among those,
    /// a bucket is dirty when it holds a row newer than `last_rev` or when it
    /// became final since `last_cutoff`.
    pub fn is_dirty(&self, bucket_start: DateTime<Utc>, rev: i64) -> bool {
        // ---
        let bucket_end = bucket_start + chrono::Duration::seconds(self.width_secs);
        if bucket_end > self.cutoff {
            return false;
        }
        rev > self.last_rev || self.last_cutoff.map_or(true, |last| bucket_end > last)
    }
}

/// The append-only readings log with its dedup guarantee.
#[async_trait]
pub trait ReadingLog: Send + Sync {
    // ---
    /// Insert unless `(probe_id, ts, seq)` already exists; never overwrites.
    /// Rows with a null `seq` are never treated as duplicates of each other.
    async fn insert_reading(&self, reading: &ValidatedReading) -> Result<WriteOutcome>;

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()>;

    async fn readings_in_range(&self, query: &RangeQuery) -> Result<Vec<Reading>>;

    async fn latest_ts(&self) -> Result<Option<DateTime<Utc>>>;

    /// Whether any reading is timestamped strictly after `since`.
    async fn has_readings_after(&self, since: DateTime<Utc>) -> Result<bool>;

    async fn reading_count(&self) -> Result<i64>;

    /// Rows committed without a calibration, ordered by id, after `after_id`.
    async fn uncalibrated_after(&self, after_id: i64, limit: i64) -> Result<Vec<Reading>>;

    /// Fill derived fields of a still-uncalibrated row and bump its revision.
    /// Returns `false` when the row was already calibrated.
    async fn backfill_derived(&self, id: i64, derived: &Derived) -> Result<bool>;
}

/// Read-only view of the probe calibration registry.
#[async_trait]
pub trait CalibrationResolver: Send + Sync {
    async fn resolve(&self, probe_id: i64, ts: DateTime<Utc>) -> Result<Option<Calibration>>;
}

/// Read-only view of the probe threshold registry.
#[async_trait]
pub trait ThresholdRegistry: Send + Sync {
    async fn thresholds(&self, probe_id: i64) -> Result<Option<ProbeThresholds>>;
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    // ---
    async fn load_cursor(&self, name: &str) -> Result<RollupCursor>;

    async fn save_cursor(&self, cursor: &RollupCursor) -> Result<()>;

    /// Highest revision currently in the log (0 when empty).
    async fn max_rev(&self) -> Result<i64>;

    async fn dirty_buckets(&self, scan: &DirtyScan) -> Result<Vec<BucketKey>>;

    /// Rows of one probe with `start <= ts < end`.
    async fn readings_in_window(
        &self,
        probe_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Insert or fully replace one bucket, atomically.
    async fn upsert_bucket(&self, bucket: &RollupBucket) -> Result<()>;

    async fn buckets_in_range(&self, query: &RangeQuery) -> Result<Vec<RollupBucket>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    // ---
    async fn load_snapshot(&self, probe_id: i64) -> Result<Option<AlertSnapshot>>;

    /// Replace the snapshot and append its transition events in one unit.
    async fn save_snapshot(&self, snapshot: &AlertSnapshot, events: &[AlertEvent]) -> Result<()>;

    async fn snapshots(&self) -> Result<Vec<AlertSnapshot>>;

    /// Newest first.
    async fn alert_events(&self, probe_id: Option<i64>, limit: i64) -> Result<Vec<AlertEvent>>;
}

/// Everything the service needs from one backing store.
pub trait Store:
    ReadingLog + CalibrationResolver + ThresholdRegistry + RollupStore + AlertStore + 'static
{
}

impl<T> Store for T where
    T: ReadingLog + CalibrationResolver + ThresholdRegistry + RollupStore + AlertStore + 'static
{
}
