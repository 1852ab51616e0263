//! In-process store with the same contracts as `PgStore`.
//!
//! All state sits behind one mutex, so check-and-insert in
//! `insert_reading` is atomic just like the unique index in Postgres.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    AlertStore, CalibrationResolver, DirtyScan, RangeQuery, ReadingLog, RollupStore,
    ThresholdRegistry,
};
use crate::models::{
    AlertEvent, AlertSnapshot, BucketKey, Calibration, DeadLetter, Derived, ProbeThresholds,
    Reading, RollupBucket, RollupCursor, ValidatedReading, WriteOutcome,
};
use crate::rollup::bucket_start_of;

// ---

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    // ---
    readings: Vec<Reading>,
    seq_keys: HashSet<(i64, DateTime<Utc>, i64)>,
    next_id: i64,
    next_rev: i64,
    dead_letters: Vec<DeadLetter>,
    calibrations: Vec<Calibration>,
    thresholds: HashMap<i64, ProbeThresholds>,
    buckets: BTreeMap<BucketKey, RollupBucket>,
    cursors: HashMap<String, RollupCursor>,
    snapshots: BTreeMap<i64, AlertSnapshot>,
    events: Vec<AlertEvent>,
    failing_upserts: HashSet<i64>,
    registry_down: bool,
}

impl Inner {
    // ---
    fn bump_rev(&mut self) -> i64 {
        self.next_rev += 1;
        self.next_rev
    }
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_calibration(&self, calibration: Calibration) {
        self.lock().calibrations.push(calibration);
    }

    pub fn set_thresholds(&self, thresholds: ProbeThresholds) {
        self.lock().thresholds.insert(thresholds.probe_id, thresholds);
    }

    /// Make the calibration and threshold lookups fail, as during an outage.
    pub fn set_registry_down(&self, down: bool) {
        self.lock().registry_down = down;
    }

    /// Make every bucket upsert for `probe_id` fail until cleared.
    pub fn fail_bucket_upserts(&self, probe_id: i64, fail: bool) {
        let mut inner = self.lock();
        if fail {
            inner.failing_upserts.insert(probe_id);
        } else {
            inner.failing_upserts.remove(&probe_id);
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    pub fn all_buckets(&self) -> Vec<RollupBucket> {
        self.lock().buckets.values().cloned().collect()
    }
}

#[async_trait]
impl ReadingLog for MemoryStore {
    // ---
    async fn insert_reading(&self, reading: &ValidatedReading) -> Result<WriteOutcome> {
        // ---
        let mut inner = self.lock();
        if let Some(seq) = reading.seq {
            if !inner.seq_keys.insert((reading.probe_id, reading.ts, seq)) {
                return Ok(WriteOutcome::Duplicate);
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let rev = inner.bump_rev();
        inner.readings.push(Reading {
            id,
            rev,
            probe_id: reading.probe_id,
            ts: reading.ts,
            seq: reading.seq,
            lux: reading.lux,
            rh: reading.rh,
            temp_c: reading.temp_c,
            moisture_raw: reading.moisture_raw,
            moisture_pct: reading.moisture_pct,
            calibration_id: reading.calibration_id,
            err: reading.err_text(),
            raw: reading.raw.clone(),
        });
        Ok(WriteOutcome::Inserted(id))
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.lock().dead_letters.push(letter.clone());
        Ok(())
    }

    async fn readings_in_range(&self, query: &RangeQuery) -> Result<Vec<Reading>> {
        // ---
        let inner = self.lock();
        let mut rows: Vec<Reading> = inner
            .readings
            .iter()
            .filter(|r| query.matches(r.probe_id, r.ts))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.ts, r.id));
        if !query.oldest_first {
            rows.reverse();
        }
        rows.truncate(query.limit.max(0) as usize);
        Ok(rows)
    }

    async fn latest_ts(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().readings.iter().map(|r| r.ts).max())
    }

    async fn has_readings_after(&self, since: DateTime<Utc>) -> Result<bool> {
        Ok(self.lock().readings.iter().any(|r| r.ts > since))
    }

    async fn reading_count(&self) -> Result<i64> {
        Ok(self.lock().readings.len() as i64)
    }

    async fn uncalibrated_after(&self, after_id: i64, limit: i64) -> Result<Vec<Reading>> {
        // ---
        let inner = self.lock();
        Ok(inner
            .readings
            .iter()
            .filter(|r| r.id > after_id && r.calibration_id.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn backfill_derived(&self, id: i64, derived: &Derived) -> Result<bool> {
        // ---
        let mut inner = self.lock();
        let rev = inner.next_rev + 1;
        let Some(row) = inner
            .readings
            .iter_mut()
            .find(|r| r.id == id && r.calibration_id.is_none())
        else {
            return Ok(false);
        };
        row.moisture_pct = derived.moisture_pct;
        row.calibration_id = derived.calibration_id;
        row.err = derived.err.clone();
        row.rev = rev;
        inner.next_rev = rev;
        Ok(true)
    }
}

#[async_trait]
impl CalibrationResolver for MemoryStore {
    // ---
    async fn resolve(&self, probe_id: i64, ts: DateTime<Utc>) -> Result<Option<Calibration>> {
        // ---
        let inner = self.lock();
        if inner.registry_down {
            return Err(anyhow!("calibration registry unavailable"));
        }
        Ok(inner
            .calibrations
            .iter()
            .filter(|c| c.probe_id == probe_id && c.is_active_at(ts))
            .max_by_key(|c| (c.valid_from, c.id))
            .cloned())
    }
}

#[async_trait]
impl ThresholdRegistry for MemoryStore {
    // ---
    async fn thresholds(&self, probe_id: i64) -> Result<Option<ProbeThresholds>> {
        // ---
        let inner = self.lock();
        if inner.registry_down {
            return Err(anyhow!("threshold registry unavailable"));
        }
        Ok(inner.thresholds.get(&probe_id).cloned())
    }
}

#[async_trait]
impl RollupStore for MemoryStore {
    // ---
    async fn load_cursor(&self, name: &str) -> Result<RollupCursor> {
        // ---
        Ok(self
            .lock()
            .cursors
            .get(name)
            .cloned()
            .unwrap_or_else(|| RollupCursor::new(name)))
    }

    async fn save_cursor(&self, cursor: &RollupCursor) -> Result<()> {
        self.lock().cursors.insert(cursor.name.clone(), cursor.clone());
        Ok(())
    }

    async fn max_rev(&self) -> Result<i64> {
        Ok(self.lock().next_rev)
    }

    async fn dirty_buckets(&self, scan: &DirtyScan) -> Result<Vec<BucketKey>> {
        // ---
        let inner = self.lock();
        let keys: std::collections::BTreeSet<BucketKey> = inner
            .readings
            .iter()
            .filter_map(|r| {
                let bucket_start = bucket_start_of(r.ts, scan.width_secs);
                scan.is_dirty(bucket_start, r.rev).then_some(BucketKey {
                    probe_id: r.probe_id,
                    bucket_start,
                })
            })
            .collect();
        let mut keys: Vec<BucketKey> = keys.into_iter().collect();
        keys.sort_by_key(|k| (k.bucket_start, k.probe_id));
        Ok(keys)
    }

    async fn readings_in_window(
        &self,
        probe_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        // ---
        let inner = self.lock();
        let mut rows: Vec<Reading> = inner
            .readings
            .iter()
            .filter(|r| r.probe_id == probe_id && r.ts >= start && r.ts < end)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.ts, r.id));
        Ok(rows)
    }

    async fn upsert_bucket(&self, bucket: &RollupBucket) -> Result<()> {
        // ---
        let mut inner = self.lock();
        if inner.failing_upserts.contains(&bucket.probe_id) {
            return Err(anyhow!(
                "upsert failed for probe {} bucket {}",
                bucket.probe_id,
                bucket.bucket_start
            ));
        }
        inner.buckets.insert(bucket.key(), bucket.clone());
        Ok(())
    }

    async fn buckets_in_range(&self, query: &RangeQuery) -> Result<Vec<RollupBucket>> {
        // ---
        let inner = self.lock();
        let mut rows: Vec<RollupBucket> = inner
            .buckets
            .values()
            .filter(|b| query.matches(b.probe_id, b.bucket_start))
            .cloned()
            .collect();
        rows.sort_by_key(|b| (b.bucket_start, b.probe_id));
        if !query.oldest_first {
            rows.reverse();
        }
        rows.truncate(query.limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    // ---
    async fn load_snapshot(&self, probe_id: i64) -> Result<Option<AlertSnapshot>> {
        Ok(self.lock().snapshots.get(&probe_id).cloned())
    }

    async fn save_snapshot(&self, snapshot: &AlertSnapshot, events: &[AlertEvent]) -> Result<()> {
        // ---
        let mut inner = self.lock();
        inner.snapshots.insert(snapshot.probe_id, snapshot.clone());
        for event in events {
            if !inner.events.iter().any(|e| e.event_id == event.event_id) {
                inner.events.push(event.clone());
            }
        }
        Ok(())
    }

    async fn snapshots(&self) -> Result<Vec<AlertSnapshot>> {
        Ok(self.lock().snapshots.values().cloned().collect())
    }

    async fn alert_events(&self, probe_id: Option<i64>, limit: i64) -> Result<Vec<AlertEvent>> {
        // ---
        let inner = self.lock();
        Ok(inner
            .events
            .iter()
            .rev()
            .filter(|e| probe_id.map_or(true, |p| p == e.probe_id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn validated(seq: Option<i64>) -> ValidatedReading {
        // ---
        ValidatedReading {
            probe_id: 1,
            ts: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
            seq,
            lux: None,
            rh: Some(40.0),
            temp_c: None,
            moisture_raw: 300,
            moisture_pct: None,
            calibration_id: None,
            err: Vec::new(),
            raw: None,
        }
    }

    #[tokio::test]
    async fn test_seq_key_deduplicates() {
        // ---
        let store = MemoryStore::new();
        assert_eq!(
            store.insert_reading(&validated(Some(5))).await.unwrap(),
            WriteOutcome::Inserted(1)
        );
        assert_eq!(
            store.insert_reading(&validated(Some(5))).await.unwrap(),
            WriteOutcome::Duplicate
        );
        assert_eq!(store.reading_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_insert_once() {
        // ---
        let store = std::sync::Arc::new(MemoryStore::new());
        let (a, b) = (store.clone(), store.clone());

        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.insert_reading(&validated(Some(9))).await }),
            tokio::spawn(async move { b.insert_reading(&validated(Some(9))).await }),
        );
        let outcomes = [first.unwrap().unwrap(), second.unwrap().unwrap()];

        let inserted = outcomes
            .iter()
            .filter(|o| matches!(o, WriteOutcome::Inserted(_)))
            .count();
        assert_eq!(inserted, 1);
        assert!(outcomes.contains(&WriteOutcome::Duplicate));
        assert_eq!(store.reading_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_has_readings_after_is_strict() {
        // ---
        let store = MemoryStore::new();
        let ts = validated(None).ts;
        assert!(!store.has_readings_after(ts - chrono::Duration::hours(1)).await.unwrap());

        store.insert_reading(&validated(None).with_raw(b" {\"probe_id\":1}\n")).await.unwrap();
        assert!(store.has_readings_after(ts - chrono::Duration::seconds(1)).await.unwrap());
        assert!(!store.has_readings_after(ts).await.unwrap());

        let rows = store.uncalibrated_after(0, 1).await.unwrap();
        assert_eq!(rows[0].raw.as_deref(), Some(r#"{"probe_id":1}"#));
    }

    #[tokio::test]
    async fn test_null_seq_never_deduplicates() {
        // ---
        let store = MemoryStore::new();
        store.insert_reading(&validated(None)).await.unwrap();
        store.insert_reading(&validated(None)).await.unwrap();
        assert_eq!(store.reading_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_backfill_only_touches_uncalibrated_rows() {
        // ---
        let store = MemoryStore::new();
        store.insert_reading(&validated(Some(1))).await.unwrap();
        let before = store.max_rev().await.unwrap();

        let derived = Derived {
            moisture_pct: Some(50.0),
            calibration_id: Some(4),
            err: None,
        };
        assert!(store.backfill_derived(1, &derived).await.unwrap());
        assert!(!store.backfill_derived(1, &derived).await.unwrap());
        assert!(store.max_rev().await.unwrap() > before);
        assert!(store.uncalibrated_after(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_calibration_wins() {
        // ---
        let store = MemoryStore::new();
        for (id, day) in [(1, 1), (2, 15)] {
            store.add_calibration(Calibration {
                id,
                probe_id: 1,
                raw_dry: 450,
                raw_wet: 190,
                raw_min: None,
                raw_max: None,
                valid_from: Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap(),
                valid_to: None,
            });
        }

        let early = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap();
        assert_eq!(store.resolve(1, early).await.unwrap().map(|c| c.id), Some(1));
        assert_eq!(store.resolve(1, late).await.unwrap().map(|c| c.id), Some(2));
        assert!(store.resolve(2, late).await.unwrap().is_none());
    }
}
