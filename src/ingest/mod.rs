//! Ingestion pipeline: decode, validate, calibrate, dedup-write, then alert.
//!
//! One [`Ingestor`] is shared by every transport connection. Lines from a
//! single connection are processed strictly in arrival order. Across
//! connections, the store's uniqueness guarantee arbitrates writes and a
//! per-probe lock orders alert evaluation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts;
use crate::models::{DeadLetter, WriteOutcome};
use crate::store::{CalibrationResolver, ReadingLog, Store};

pub mod backfill;
pub mod decoder;
pub mod source;
pub mod validator;

// ---

/// Log one decode error, then every Nth.
const DECODE_LOG_EVERY: u64 = 10;

/// What happened to one input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Blank,
    DecodeFailed,
    Rejected,
    Committed(i64),
    Duplicate,
}

/// Process-wide ingest counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    // ---
    lines: AtomicU64,
    committed: AtomicU64,
    duplicates: AtomicU64,
    decode_errors: AtomicU64,
    rejects: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub lines: u64,
    pub committed: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub rejects: u64,
    pub failures: u64,
}

impl IngestStats {
    // ---
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn counts(&self) -> IngestCounts {
        IngestCounts {
            lines: self.lines.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// One async lock per probe; alert snapshot load and save for a probe
/// never interleave.
#[derive(Debug, Default)]
struct ProbeLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProbeLocks {
    // ---
    fn lock_for(&self, probe_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(probe_id).or_default())
    }
}

pub struct Ingestor<S> {
    store: Arc<S>,
    stats: Arc<IngestStats>,
    alert_locks: Arc<ProbeLocks>,
}

impl<S> Clone for Ingestor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
            alert_locks: Arc::clone(&self.alert_locks),
        }
    }
}

impl<S: Store> Ingestor<S> {
    // ---
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            stats: Arc::new(IngestStats::default()),
            alert_locks: Arc::new(ProbeLocks::default()),
        }
    }

    pub fn stats(&self) -> IngestCounts {
        self.stats.counts()
    }

    /// Run one raw line through the pipeline.
    ///
    /// Bad input never fails the call; only store errors on the write path
    /// are returned.
    pub async fn process_line(&self, line: &[u8], received_at: DateTime<Utc>) -> Result<IngestOutcome> {
        // ---
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(IngestOutcome::Blank);
        }
        IngestStats::bump(&self.stats.lines);

        let candidate = match decoder::decode(line) {
            Ok(candidate) => candidate,
            Err(e) => {
                let n = IngestStats::bump(&self.stats.decode_errors);
                if n == 1 || n % DECODE_LOG_EVERY == 0 {
                    warn!(reason = e.code(), error = %e, decode_errors = n, "discarding undecodable line");
                }
                return Ok(IngestOutcome::DecodeFailed);
            }
        };

        let ts = validator::resolve_ts(&candidate, received_at);
        let calibration = match self.store.resolve(candidate.probe_id, ts).await {
            Ok(calibration) => calibration,
            Err(e) => {
                warn!(probe_id = candidate.probe_id, error = %e, "calibration lookup failed, storing uncalibrated");
                None
            }
        };

        let reading = match validator::validate(&candidate, ts, calibration.as_ref()) {
            Ok(reading) => reading.with_raw(line),
            Err(reject) => {
                IngestStats::bump(&self.stats.rejects);
                warn!(
                    probe_id = candidate.probe_id,
                    reason = reject.code(),
                    detail = %reject.detail(),
                    "rejecting reading"
                );
                self.store
                    .record_dead_letter(&DeadLetter {
                        received_at,
                        line: String::from_utf8_lossy(line).into_owned(),
                        reason: reject.code().to_string(),
                        detail: Some(reject.detail().to_string()),
                    })
                    .await?;
                return Ok(IngestOutcome::Rejected);
            }
        };

        match self.store.insert_reading(&reading).await? {
            WriteOutcome::Duplicate => {
                IngestStats::bump(&self.stats.duplicates);
                debug!(probe_id = reading.probe_id, ts = %reading.ts, seq = ?reading.seq, "duplicate reading");
                Ok(IngestOutcome::Duplicate)
            }
            WriteOutcome::Inserted(id) => {
                IngestStats::bump(&self.stats.committed);
                let lock = self.alert_locks.lock_for(reading.probe_id);
                let _guard = lock.lock().await;
                if let Err(e) = alerts::evaluate(&*self.store, &reading, id, Utc::now()).await {
                    warn!(probe_id = reading.probe_id, error = %e, "alert evaluation failed, keeping prior state");
                }
                Ok(IngestOutcome::Committed(id))
            }
        }
    }

    /// Consume a line stream until EOF or cancellation.
    ///
    /// Returns the number of lines read.
    pub async fn run_lines<R>(&self, mut reader: R, peer: &str, cancel: &CancellationToken) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        // ---
        let mut buf = Vec::with_capacity(512);
        let mut count = 0;

        loop {
            buf.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                break;
            }
            count += 1;

            if let Err(e) = self.process_line(&buf, Utc::now()).await {
                IngestStats::bump(&self.stats.failures);
                error!(peer, error = %e, "failed to store line, continuing");
            }
        }

        let counts = self.stats();
        info!(
            peer,
            lines = count,
            total_committed = counts.committed,
            total_duplicates = counts.duplicates,
            total_decode_errors = counts.decode_errors,
            total_rejects = counts.rejects,
            "ingest stream closed"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{Calibration, Limits, ProbeThresholds, RuleId};
    use crate::store::{AlertStore, RangeQuery, ReadingLog};
    use chrono::TimeZone;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn ingestor() -> (Arc<crate::store::MemoryStore>, Ingestor<crate::store::MemoryStore>) {
        let store = Arc::new(crate::store::MemoryStore::new());
        (Arc::clone(&store), Ingestor::new(store))
    }

    fn calibration() -> Calibration {
        // ---
        Calibration {
            id: 1,
            probe_id: 1,
            raw_dry: 450,
            raw_wet: 190,
            raw_min: None,
            raw_max: None,
            valid_from: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            valid_to: None,
        }
    }

    #[tokio::test]
    async fn test_idempotent_ingestion() {
        // ---
        let (store, ingestor) = ingestor();
        store.add_calibration(calibration());
        let line = br#"{"probe_id":1,"ts":"2025-03-01 11:00:00","seq":5,"rh":45.0,"moisture_raw":320}"#;

        let first = ingestor.process_line(line, received()).await.unwrap();
        assert!(matches!(first, IngestOutcome::Committed(_)));
        for _ in 0..3 {
            assert_eq!(
                ingestor.process_line(line, received()).await.unwrap(),
                IngestOutcome::Duplicate
            );
        }

        assert_eq!(store.reading_count().await.unwrap(), 1);
        let rows = store
            .readings_in_range(&RangeQuery { limit: 5, ..RangeQuery::default() })
            .await
            .unwrap();
        assert_eq!(rows[0].moisture_pct, Some(50.0));
        assert_eq!(rows[0].raw.as_deref(), std::str::from_utf8(line).ok());
        assert_eq!(ingestor.stats().duplicates, 3);
    }

    #[tokio::test]
    async fn test_bad_lines_are_classified() {
        // ---
        let (store, ingestor) = ingestor();

        assert_eq!(ingestor.process_line(b"   \r\n", received()).await.unwrap(), IngestOutcome::Blank);
        assert_eq!(
            ingestor.process_line(b"{\"probe_id\":1,", received()).await.unwrap(),
            IngestOutcome::DecodeFailed
        );
        assert_eq!(
            ingestor
                .process_line(br#"{"probe_id":1,"moisture_raw":4096}"#, received())
                .await
                .unwrap(),
            IngestOutcome::Rejected
        );

        let letters = store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "invalid-moisture-raw");
        assert!(letters[0].line.contains("4096"));

        let counts = ingestor.stats();
        assert_eq!(counts.lines, 2);
        assert_eq!(counts.decode_errors, 1);
        assert_eq!(counts.rejects, 1);
        assert_eq!(store.reading_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_registry_outage_stores_uncalibrated() {
        // ---
        let (store, ingestor) = ingestor();
        store.add_calibration(calibration());
        store.set_registry_down(true);

        let outcome = ingestor
            .process_line(br#"{"probe_id":1,"moisture_raw":320}"#, received())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Committed(_)));

        let rows = store.uncalibrated_after(0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, received());
    }

    #[tokio::test]
    async fn test_alerts_run_only_on_insert() {
        // ---
        let (store, ingestor) = ingestor();
        store.add_calibration(calibration());
        let mut thresholds = ProbeThresholds::new(1);
        thresholds.moisture_pct = Limits::new(Some(30.0), None);
        store.set_thresholds(thresholds);

        // raw 420 is about 12 %, below the dry threshold.
        let line = br#"{"probe_id":1,"ts":"2025-03-01 11:00:00","seq":1,"moisture_raw":420}"#;
        ingestor.process_line(line, received()).await.unwrap();
        ingestor.process_line(line, received()).await.unwrap();

        let snapshot = store.load_snapshot(1).await.unwrap().unwrap();
        assert!(snapshot.is_open(RuleId::TooDry));
        assert_eq!(store.alert_events(Some(1), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_alert_lock_is_shared_per_probe() {
        // ---
        let (_store, ingestor) = ingestor();
        let other = ingestor.clone();

        let lock = ingestor.alert_locks.lock_for(1);
        let _held = lock.lock().await;

        // A second connection for the same probe waits; other probes do not.
        assert!(other.alert_locks.lock_for(1).try_lock().is_err());
        assert!(other.alert_locks.lock_for(2).try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_run_lines_keeps_going_past_garbage() {
        // ---
        let (store, ingestor) = ingestor();
        let input: &[u8] = b"{\"probe_id\":1,\"seq\":1,\"moisture_raw\":300}\n\
            \xff\xfe garbage\n\
            \n\
            {\"probe_id\":1,\"seq\":2,\"moisture_raw\":301}\r\n\
            {\"probe_id\":2,\"seq\":1,\"moisture_raw\":302}";

        let lines = ingestor
            .run_lines(input, "test", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(lines, 5);
        assert_eq!(store.reading_count().await.unwrap(), 3);
        assert_eq!(ingestor.stats().decode_errors, 1);
    }
}
