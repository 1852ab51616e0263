use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::io::BufReader;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use plantpipe::ingest::backfill::{self, BackfillCursor};
use plantpipe::models::{Calibration, Limits, ProbeThresholds, RuleId, Transition};
use plantpipe::store::{AlertStore, RangeQuery, ReadingLog, RollupStore};
use plantpipe::{rollup, Ingestor, MemoryStore, RollupSettings};

// ---

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, h, m, s).unwrap()
}

fn line(probe_id: i64, ts: &str, seq: i64, rh: f64, moisture_raw: i64) -> String {
    format!(
        "{{\"probe_id\":{probe_id},\"ts\":\"{ts}\",\"seq\":{seq},\"rh\":{rh},\"moisture_raw\":{moisture_raw}}}\n"
    )
}

fn calibration(valid_from: DateTime<Utc>) -> Calibration {
    Calibration {
        id: 1,
        probe_id: 1,
        raw_dry: 450,
        raw_wet: 190,
        raw_min: None,
        raw_max: None,
        valid_from,
        valid_to: None,
    }
}

#[tokio::test]
async fn retransmitted_feed_is_stored_once() {
    // ---
    let store = Arc::new(MemoryStore::new());
    store.add_calibration(calibration(at(0, 0, 0)));
    let ingestor = Ingestor::new(Arc::clone(&store));

    let first = line(1, "2025-03-01 10:00:00", 1, 40.0, 320);
    let second = line(1, "2025-03-01 10:01:00", 2, 45.0, 330);

    // Two reconnects replaying overlapping windows, out of order, with noise.
    let mock = tokio_test::io::Builder::new()
        .read(first.as_bytes())
        .read(b"{\"probe_id\":1,\"moisture_raw\":\n")
        .read(second.as_bytes())
        .read(first.as_bytes())
        .build();
    let lines = assert_ok!(
        ingestor
            .run_lines(BufReader::new(mock), "feed-a", &CancellationToken::new())
            .await
    );
    assert_eq!(lines, 4);

    let replay = tokio_test::io::Builder::new()
        .read(second.as_bytes())
        .read(first.as_bytes())
        .build();
    assert_ok!(
        ingestor
            .run_lines(BufReader::new(replay), "feed-b", &CancellationToken::new())
            .await
    );

    assert_eq!(store.reading_count().await.unwrap(), 2);
    let counts = ingestor.stats();
    assert_eq!(counts.committed, 2);
    assert_eq!(counts.duplicates, 3);
    assert_eq!(counts.decode_errors, 1);

    let rows = store
        .readings_in_range(&RangeQuery {
            probe_id: Some(1),
            limit: 10,
            oldest_first: true,
            ..RangeQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(rows[0].moisture_pct, Some(50.0));
    assert_eq!(rows[1].rh, Some(45.0));
}

#[tokio::test]
async fn late_arrival_corrects_bucket_then_stays_stable() {
    // ---
    let store = Arc::new(MemoryStore::new());
    let ingestor = Ingestor::new(Arc::clone(&store));
    let settings = RollupSettings::default();
    let cancel = CancellationToken::new();

    for (seq, (ts, rh)) in [("2025-03-01 10:00:10", 40.0), ("2025-03-01 10:01:00", 50.0), ("2025-03-01 10:02:00", 60.0)]
        .into_iter()
        .enumerate()
    {
        let l = line(1, ts, seq as i64, rh, 300);
        ingestor.process_line(l.as_bytes(), at(10, 3, 0)).await.unwrap();
    }

    let report = rollup::tick(&*store, &settings, at(10, 8, 0), &cancel).await.unwrap();
    assert!(report.advanced);
    let bucket = &store.all_buckets()[0];
    assert_eq!((bucket.count, bucket.rh_avg), (3, Some(50.0)));

    // A reading for the closed bucket shows up after the watermark passed it.
    let late = line(1, "2025-03-01 10:03:00", 9, 70.0, 300);
    ingestor.process_line(late.as_bytes(), at(10, 9, 0)).await.unwrap();
    rollup::tick(&*store, &settings, at(10, 9, 30), &cancel).await.unwrap();

    let corrected = store.all_buckets()[0].clone();
    assert_eq!(corrected.count, 4);
    assert_eq!(corrected.rh_avg, Some(55.0));

    for minutes in [1, 5, 60] {
        let report = rollup::tick(&*store, &settings, at(10, 10, 0) + Duration::minutes(minutes), &cancel)
            .await
            .unwrap();
        assert_eq!(report.written, 0);
    }
    assert_eq!(store.all_buckets(), vec![corrected]);
}

#[tokio::test]
async fn backfill_feeds_rollup_recompute() {
    // ---
    let store = Arc::new(MemoryStore::new());
    let ingestor = Ingestor::new(Arc::clone(&store));
    let settings = RollupSettings::default();
    let cancel = CancellationToken::new();

    let l = line(1, "2025-03-01 10:01:00", 1, 40.0, 320);
    ingestor.process_line(l.as_bytes(), at(10, 1, 0)).await.unwrap();
    rollup::tick(&*store, &settings, at(10, 8, 0), &cancel).await.unwrap();
    assert_eq!(store.all_buckets()[0].moisture_pct_avg, None);

    // Calibration registered after the fact.
    store.add_calibration(calibration(at(0, 0, 0)));
    let mut cursor = BackfillCursor::default();
    assert_eq!(backfill::run_batch(&*store, &mut cursor, 100).await.unwrap(), 1);

    let report = rollup::tick(&*store, &settings, at(10, 9, 0), &cancel).await.unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(store.all_buckets()[0].moisture_pct_avg, Some(50.0));
    assert!(store.load_cursor(rollup::DEFAULT_CURSOR).await.unwrap().last_rev >= 2);
}

#[tokio::test]
async fn sustained_dry_spell_alerts_once() {
    // ---
    let store = Arc::new(MemoryStore::new());
    store.add_calibration(calibration(at(0, 0, 0)));
    let mut thresholds = ProbeThresholds::new(1);
    thresholds.moisture_pct = Limits::new(Some(30.0), None);
    store.set_thresholds(thresholds);
    let ingestor = Ingestor::new(Arc::clone(&store));

    // raw 420 is about 12 %; one reading per minute for 31 minutes.
    for minute in 0..=31 {
        let ts = (at(6, 0, 0) + Duration::minutes(minute)).format("%Y-%m-%d %H:%M:%S").to_string();
        let l = line(1, &ts, minute, 50.0, 420);
        ingestor.process_line(l.as_bytes(), at(7, 0, 0)).await.unwrap();
    }
    // Back above the threshold.
    let l = line(1, "2025-03-01 06:32:00", 32, 50.0, 320);
    ingestor.process_line(l.as_bytes(), at(7, 0, 0)).await.unwrap();

    let events = store.alert_events(Some(1), 100).await.unwrap();
    let sustained: Vec<_> = events
        .iter()
        .filter(|e| e.rule == RuleId::MoistureLowSustain)
        .map(|e| e.transition)
        .collect();
    // Newest first.
    assert_eq!(sustained, vec![Transition::Clear, Transition::Open]);

    let snapshot = store.load_snapshot(1).await.unwrap().unwrap();
    assert!(!snapshot.is_open(RuleId::MoistureLowSustain));
    assert!(!snapshot.is_open(RuleId::TooDry));
}

#[tokio::test]
async fn same_second_samples_keep_every_transition() {
    // ---
    let store = Arc::new(MemoryStore::new());
    store.add_calibration(calibration(at(0, 0, 0)));
    let mut thresholds = ProbeThresholds::new(1);
    thresholds.moisture_pct = Limits::new(Some(30.0), None);
    store.set_thresholds(thresholds);
    let ingestor = Ingestor::new(Arc::clone(&store));

    // No seq, one shared second: dry, wet, dry, wet.
    for moisture_raw in [420, 320, 420, 320] {
        let l = format!(r#"{{"probe_id":1,"ts":"2025-03-01 08:00:00","moisture_raw":{moisture_raw}}}"#);
        ingestor.process_line(l.as_bytes(), at(8, 0, 1)).await.unwrap();
    }

    assert_eq!(store.reading_count().await.unwrap(), 4);
    let events = store.alert_events(Some(1), 10).await.unwrap();
    let too_dry: Vec<_> = events
        .iter()
        .filter(|e| e.rule == RuleId::TooDry)
        .map(|e| e.transition)
        .collect();
    assert_eq!(
        too_dry,
        vec![Transition::Clear, Transition::Open, Transition::Clear, Transition::Open]
    );
}
