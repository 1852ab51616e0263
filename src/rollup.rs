//! Rollup aggregator: folds the readings log into fixed-width buckets.
//!
//! Each tick recomputes every dirty bucket completely from the log instead of
//! applying deltas, so late arrivals and dedup corrections always converge to
//! the exact aggregate. Progress is an explicit [`RollupCursor`] persisted per
//! consumer name:
//!
//! - `last_cutoff`: buckets ending at or before it are final
//! - `last_rev`: highest log revision already folded
//!
//! The cursor only advances when every dirty bucket of the tick was written.
//! A tick that fails or is cancelled leaves it in place and the next tick
//! retries the same work.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ingest::backfill::{self, BackfillCursor};
use crate::models::{BucketKey, Reading, RollupBucket};
use crate::store::{DirtyScan, RollupStore, Store};
use crate::Config;

// ---

pub const DEFAULT_CURSOR: &str = "reading_rollups";

/// Tunables of the rollup worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupSettings {
    // ---
    pub cursor_name: String,
    pub width_secs: i64,
    /// Allowance for late, out-of-order readings.
    pub grace_secs: i64,
    pub tick_secs: u64,
    pub backfill_batch: i64,
}

impl RollupSettings {
    // ---
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            cursor_name: DEFAULT_CURSOR.to_string(),
            width_secs: cfg.rollup_bucket_secs as i64,
            grace_secs: cfg.rollup_grace_secs as i64,
            tick_secs: cfg.rollup_tick_secs,
            backfill_batch: i64::from(cfg.backfill_batch),
        }
    }
}

impl Default for RollupSettings {
    fn default() -> Self {
        Self {
            cursor_name: DEFAULT_CURSOR.to_string(),
            width_secs: 300,
            grace_secs: 120,
            tick_secs: 60,
            backfill_batch: 500,
        }
    }
}

/// Outcome of one tick, for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupReport {
    // ---
    pub cutoff: DateTime<Utc>,
    pub dirty: usize,
    pub written: usize,
    pub empty: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub advanced: bool,
}

/// Start of the bucket containing `ts`, aligned to the Unix epoch.
pub fn bucket_start_of(ts: DateTime<Utc>, width_secs: i64) -> DateTime<Utc> {
    // ---
    let secs = ts.timestamp();
    let start = secs - secs.rem_euclid(width_secs.max(1));
    DateTime::from_timestamp(start, 0).unwrap_or(ts)
}

#[derive(Debug, Default)]
struct MetricStats {
    sum: f64,
    n: u32,
    min: Option<f64>,
    max: Option<f64>,
}

impl MetricStats {
    // ---
    fn push(&mut self, value: Option<f64>) {
        let Some(v) = value else { return };
        self.sum += v;
        self.n += 1;
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    fn avg(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / f64::from(self.n))
    }
}

/// Aggregate the rows of one bucket. `None` when the bucket is empty.
pub fn fold_bucket(
    key: BucketKey,
    width_secs: i64,
    rows: &[Reading],
    now: DateTime<Utc>,
) -> Option<RollupBucket> {
    // ---
    if rows.is_empty() {
        return None;
    }

    let (mut lux, mut rh, mut temp_c) = (MetricStats::default(), MetricStats::default(), MetricStats::default());
    let (mut pct, mut raw) = (MetricStats::default(), MetricStats::default());
    let mut err_count = 0;

    for row in rows {
        lux.push(row.lux);
        rh.push(row.rh);
        temp_c.push(row.temp_c);
        pct.push(row.moisture_pct);
        raw.push(Some(f64::from(row.moisture_raw)));
        if row.has_fault() {
            err_count += 1;
        }
    }

    Some(RollupBucket {
        probe_id: key.probe_id,
        bucket_start: key.bucket_start,
        width_secs,
        count: rows.len() as i64,
        lux_avg: lux.avg(),
        lux_min: lux.min,
        lux_max: lux.max,
        rh_avg: rh.avg(),
        rh_min: rh.min,
        rh_max: rh.max,
        temp_c_avg: temp_c.avg(),
        temp_c_min: temp_c.min,
        temp_c_max: temp_c.max,
        moisture_pct_avg: pct.avg(),
        moisture_pct_min: pct.min,
        moisture_pct_max: pct.max,
        moisture_raw_avg: raw.avg(),
        moisture_raw_min: raw.min,
        moisture_raw_max: raw.max,
        err_count,
        updated_at: now,
    })
}

/// Recompute one bucket from the log and upsert it.
async fn recompute<S>(
    store: &S,
    key: BucketKey,
    width_secs: i64,
    now: DateTime<Utc>,
) -> Result<Option<RollupBucket>>
where
    S: RollupStore + ?Sized,
{
    // ---
    let end = key.bucket_start + Duration::seconds(width_secs);
    let rows = store.readings_in_window(key.probe_id, key.bucket_start, end).await?;
    let Some(bucket) = fold_bucket(key, width_secs, &rows, now) else {
        return Ok(None);
    };
    store.upsert_bucket(&bucket).await?;
    Ok(Some(bucket))
}

/// Run one rollup pass as of `now`.
pub async fn tick<S>(
    store: &S,
    settings: &RollupSettings,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<RollupReport>
where
    S: RollupStore + ?Sized,
{
    // ---
    let mut cursor = store.load_cursor(&settings.cursor_name).await?;

    // The watermark never moves backwards, even if the clock does.
    let mut cutoff = now - Duration::seconds(settings.grace_secs);
    if let Some(last) = cursor.last_cutoff {
        cutoff = cutoff.max(last);
    }

    let high_rev = store.max_rev().await?;
    let scan = DirtyScan {
        width_secs: settings.width_secs,
        last_rev: cursor.last_rev,
        last_cutoff: cursor.last_cutoff,
        cutoff,
    };
    let dirty = store.dirty_buckets(&scan).await?;

    let mut report = RollupReport {
        cutoff,
        dirty: dirty.len(),
        written: 0,
        empty: 0,
        failed: 0,
        cancelled: false,
        advanced: false,
    };

    for key in dirty {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        match recompute(store, key, settings.width_secs, now).await {
            Ok(Some(_)) => report.written += 1,
            Ok(None) => report.empty += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    probe_id = key.probe_id,
                    bucket_start = %key.bucket_start,
                    error = %e,
                    "rollup bucket upsert failed"
                );
            }
        }
    }

    cursor.last_run_at = Some(now);
    if report.failed == 0 && !report.cancelled {
        cursor.last_cutoff = Some(cutoff);
        cursor.last_rev = cursor.last_rev.max(high_rev);
        report.advanced = true;
    }
    store.save_cursor(&cursor).await?;

    Ok(report)
}

/// Periodic rollup task; returns once `cancel` fires.
pub async fn run_worker<S: Store>(store: Arc<S>, settings: RollupSettings, cancel: CancellationToken) {
    // ---
    info!(
        width_secs = settings.width_secs,
        grace_secs = settings.grace_secs,
        tick_secs = settings.tick_secs,
        "rollup worker started"
    );

    let mut ticker = tokio::time::interval(StdDuration::from_secs(settings.tick_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backfill_cursor = BackfillCursor::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match backfill::run_batch(&*store, &mut backfill_cursor, settings.backfill_batch).await {
            Ok(0) => {}
            Ok(filled) => info!(filled, "backfilled derived moisture fields"),
            Err(e) => warn!(error = %e, "moisture backfill failed"),
        }

        match tick(&*store, &settings, Utc::now(), &cancel).await {
            Ok(report) if report.advanced => debug!(
                cutoff = %report.cutoff,
                written = report.written,
                "rollup tick complete"
            ),
            Ok(report) => warn!(
                cutoff = %report.cutoff,
                written = report.written,
                failed = report.failed,
                cancelled = report.cancelled,
                "rollup watermark held back"
            ),
            Err(e) => error!(error = %e, "rollup tick failed"),
        }
    }

    info!("rollup worker stopped");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::ValidatedReading;
    use crate::store::{MemoryStore, RangeQuery, ReadingLog};
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, s).unwrap()
    }

    fn reading(probe_id: i64, ts: DateTime<Utc>, seq: i64, rh: Option<f64>) -> ValidatedReading {
        // ---
        ValidatedReading {
            probe_id,
            ts,
            seq: Some(seq),
            lux: None,
            rh,
            temp_c: None,
            moisture_raw: 320,
            moisture_pct: Some(50.0),
            calibration_id: Some(1),
            err: Vec::new(),
            raw: None,
        }
    }

    async fn bucket(store: &MemoryStore, probe_id: i64, start: DateTime<Utc>) -> Option<RollupBucket> {
        // ---
        let query = RangeQuery {
            probe_id: Some(probe_id),
            start: Some(start),
            end: Some(start),
            limit: 10,
            oldest_first: true,
        };
        store.buckets_in_range(&query).await.unwrap().into_iter().next()
    }

    #[test]
    fn test_bucket_alignment() {
        // ---
        assert_eq!(bucket_start_of(at(10, 4, 59), 300), at(10, 0, 0));
        assert_eq!(bucket_start_of(at(10, 5, 0), 300), at(10, 5, 0));
        assert_eq!(bucket_start_of(at(10, 59, 59), 3600), at(10, 0, 0));
    }

    #[test]
    fn test_fold_ignores_nulls_and_counts_faults() {
        // ---
        let key = BucketKey {
            probe_id: 1,
            bucket_start: at(10, 0, 0),
        };
        let mut rows = Vec::new();
        for (id, rh) in [(1, Some(40.0)), (2, None), (3, Some(60.0))] {
            rows.push(Reading {
                id,
                rev: id,
                probe_id: 1,
                ts: at(10, 1, id as u32),
                seq: Some(id),
                lux: None,
                rh,
                temp_c: None,
                moisture_raw: 300 + id as i32,
                moisture_pct: None,
                calibration_id: None,
                err: (id == 2).then(|| "rh-out-of-range".to_string()),
                raw: None,
            });
        }

        let bucket = fold_bucket(key, 300, &rows, at(10, 10, 0)).unwrap();
        assert_eq!(bucket.count, 3);
        assert_eq!(bucket.rh_avg, Some(50.0));
        assert_eq!(bucket.lux_avg, None);
        assert_eq!(bucket.moisture_raw_min, Some(301.0));
        assert_eq!(bucket.moisture_raw_max, Some(303.0));
        assert_eq!(bucket.err_count, 1);

        assert!(fold_bucket(key, 300, &[], at(10, 10, 0)).is_none());
    }

    #[tokio::test]
    async fn test_bucket_correctness() {
        // ---
        let store = MemoryStore::new();
        for (seq, (m, rh)) in [(0, 40.0), (2, 50.0), (4, 60.0)].into_iter().enumerate() {
            store
                .insert_reading(&reading(1, at(10, m, 0), seq as i64, Some(rh)))
                .await
                .unwrap();
        }

        let settings = RollupSettings::default();
        let report = tick(&store, &settings, at(10, 8, 0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.written, 1);
        assert!(report.advanced);

        let b = bucket(&store, 1, at(10, 0, 0)).await.unwrap();
        assert_eq!(b.count, 3);
        assert_eq!(b.rh_avg, Some(50.0));
        assert_eq!(b.rh_min, Some(40.0));
        assert_eq!(b.rh_max, Some(60.0));
        assert_eq!(b.width_secs, 300);
    }

    #[tokio::test]
    async fn test_open_buckets_are_left_alone() {
        // ---
        let store = MemoryStore::new();
        store.insert_reading(&reading(1, at(10, 6, 0), 1, Some(40.0))).await.unwrap();

        // Bucket [10:05, 10:10) ends after the cutoff 10:08.
        let settings = RollupSettings::default();
        let report = tick(&store, &settings, at(10, 10, 0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.dirty, 0);
        assert!(bucket(&store, 1, at(10, 5, 0)).await.is_none());

        // Once the grace period has passed it becomes final.
        let report = tick(&store, &settings, at(10, 12, 0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(bucket(&store, 1, at(10, 5, 0)).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_late_arrival_then_stable() {
        // ---
        let store = MemoryStore::new();
        let settings = RollupSettings::default();
        let cancel = CancellationToken::new();
        for (seq, rh) in [40.0, 50.0, 60.0].into_iter().enumerate() {
            store
                .insert_reading(&reading(1, at(10, seq as u32, 0), seq as i64, Some(rh)))
                .await
                .unwrap();
        }
        tick(&store, &settings, at(10, 8, 0), &cancel).await.unwrap();

        store.insert_reading(&reading(1, at(10, 3, 0), 9, Some(70.0))).await.unwrap();
        let report = tick(&store, &settings, at(10, 9, 0), &cancel).await.unwrap();
        assert_eq!(report.written, 1);

        let corrected = bucket(&store, 1, at(10, 0, 0)).await.unwrap();
        assert_eq!(corrected.count, 4);
        assert_eq!(corrected.rh_avg, Some(55.0));
        assert_eq!(corrected.rh_max, Some(70.0));

        for minute in [20, 40] {
            let report = tick(&store, &settings, at(10, minute, 0), &cancel).await.unwrap();
            assert_eq!(report.dirty, 0);
        }
        let stable = bucket(&store, 1, at(10, 0, 0)).await.unwrap();
        assert_eq!(stable, corrected);
    }

    #[tokio::test]
    async fn test_failed_upsert_holds_watermark() {
        // ---
        let store = MemoryStore::new();
        let settings = RollupSettings::default();
        let cancel = CancellationToken::new();
        store.insert_reading(&reading(1, at(10, 1, 0), 1, Some(40.0))).await.unwrap();
        store.insert_reading(&reading(2, at(10, 1, 0), 1, Some(45.0))).await.unwrap();
        store.fail_bucket_upserts(2, true);

        let report = tick(&store, &settings, at(10, 8, 0), &cancel).await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.advanced);
        assert!(bucket(&store, 1, at(10, 0, 0)).await.is_some());

        let cursor = store.load_cursor(DEFAULT_CURSOR).await.unwrap();
        assert_eq!(cursor.last_cutoff, None);
        assert_eq!(cursor.last_run_at, Some(at(10, 8, 0)));

        store.fail_bucket_upserts(2, false);
        let report = tick(&store, &settings, at(10, 9, 0), &cancel).await.unwrap();
        assert_eq!(report.failed, 0);
        assert!(report.advanced);
        assert_eq!(bucket(&store, 2, at(10, 0, 0)).await.unwrap().rh_avg, Some(45.0));
        assert_eq!(
            store.load_cursor(DEFAULT_CURSOR).await.unwrap().last_cutoff,
            Some(at(10, 7, 0))
        );
    }

    #[tokio::test]
    async fn test_cancelled_tick_does_not_advance() {
        // ---
        let store = MemoryStore::new();
        store.insert_reading(&reading(1, at(10, 1, 0), 1, Some(40.0))).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = tick(&store, &RollupSettings::default(), at(10, 8, 0), &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.written, 0);
        assert!(!report.advanced);
        assert!(store.all_buckets().is_empty());
    }

    #[tokio::test]
    async fn test_independent_cursors() {
        // ---
        let store = MemoryStore::new();
        store.insert_reading(&reading(1, at(10, 1, 0), 1, Some(40.0))).await.unwrap();

        let five = RollupSettings::default();
        let other = RollupSettings {
            cursor_name: "audit".into(),
            ..RollupSettings::default()
        };
        let cancel = CancellationToken::new();
        tick(&store, &five, at(10, 8, 0), &cancel).await.unwrap();

        // A second consumer starts from scratch and sees the same bucket.
        let report = tick(&store, &other, at(10, 8, 0), &cancel).await.unwrap();
        assert_eq!(report.dirty, 1);
    }
}
