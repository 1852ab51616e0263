//! Postgres implementation of the store traits.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    AlertStore, CalibrationResolver, DirtyScan, RangeQuery, ReadingLog, RollupStore,
    ThresholdRegistry,
};
use crate::models::{
    AlertEvent, AlertSnapshot, BucketKey, Calibration, DeadLetter, Derived, Limits,
    ProbeThresholds, Reading, RollupBucket, RollupCursor, RuleId, RuleState, ValidatedReading,
    WriteOutcome,
};

// ---

const READING_COLUMNS: &str = "id, rev, probe_id, ts, seq, lux, rh, temp_c, \
     moisture_raw, moisture_pct, calibration_id, err, raw";

const BUCKET_COLUMNS: &str = "probe_id, bucket_start, width_secs, row_count, \
     lux_avg, lux_min, lux_max, rh_avg, rh_min, rh_max, \
     temp_c_avg, temp_c_min, temp_c_max, \
     moisture_pct_avg, moisture_pct_min, moisture_pct_max, \
     moisture_raw_avg, moisture_raw_min, moisture_raw_max, \
     err_count, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn order(oldest_first: bool) -> &'static str {
    if oldest_first {
        "ASC"
    } else {
        "DESC"
    }
}

#[async_trait]
impl ReadingLog for PgStore {
    // ---
    async fn insert_reading(&self, reading: &ValidatedReading) -> Result<WriteOutcome> {
        // ---
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO readings (
                probe_id, ts, seq, lux, rh, temp_c,
                moisture_raw, moisture_pct, calibration_id, err, raw
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (probe_id, ts, seq) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(reading.probe_id)
        .bind(reading.ts)
        .bind(reading.seq)
        .bind(reading.lux)
        .bind(reading.rh)
        .bind(reading.temp_c)
        .bind(reading.moisture_raw)
        .bind(reading.moisture_pct)
        .bind(reading.calibration_id)
        .bind(reading.err_text())
        .bind(&reading.raw)
        .fetch_optional(&self.pool)
        .await
        .context("insert reading")?;

        Ok(match inserted {
            Some((id,)) => WriteOutcome::Inserted(id),
            None => WriteOutcome::Duplicate,
        })
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO dead_letters (received_at, line, reason, detail)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(letter.received_at)
        .bind(&letter.line)
        .bind(&letter.reason)
        .bind(&letter.detail)
        .execute(&self.pool)
        .await
        .context("insert dead letter")?;
        Ok(())
    }

    async fn readings_in_range(&self, query: &RangeQuery) -> Result<Vec<Reading>> {
        // ---
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM readings
            WHERE ($1::bigint IS NULL OR probe_id = $1)
              AND ($2::timestamptz IS NULL OR ts >= $2)
              AND ($3::timestamptz IS NULL OR ts <= $3)
            ORDER BY ts {dir}, id {dir}
            LIMIT $4
            "#,
            dir = order(query.oldest_first),
        );
        let rows = sqlx::query_as::<_, Reading>(&sql)
            .bind(query.probe_id)
            .bind(query.start)
            .bind(query.end)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn latest_ts(&self) -> Result<Option<DateTime<Utc>>> {
        // ---
        let ts: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(ts) FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(ts)
    }

    async fn has_readings_after(&self, since: DateTime<Utc>) -> Result<bool> {
        // ---
        let updated: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM readings WHERE ts > $1)")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(updated)
    }

    async fn reading_count(&self) -> Result<i64> {
        // ---
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn uncalibrated_after(&self, after_id: i64, limit: i64) -> Result<Vec<Reading>> {
        // ---
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM readings
            WHERE id > $1 AND calibration_id IS NULL
            ORDER BY id
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, Reading>(&sql)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn backfill_derived(&self, id: i64, derived: &Derived) -> Result<bool> {
        // ---
        let result = sqlx::query(
            r#"
            UPDATE readings
            SET moisture_pct = $2,
                calibration_id = $3,
                err = $4,
                rev = nextval('readings_rev_seq')
            WHERE id = $1 AND calibration_id IS NULL
            "#,
        )
        .bind(id)
        .bind(derived.moisture_pct)
        .bind(derived.calibration_id)
        .bind(&derived.err)
        .execute(&self.pool)
        .await
        .context("backfill derived fields")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CalibrationResolver for PgStore {
    // ---
    async fn resolve(&self, probe_id: i64, ts: DateTime<Utc>) -> Result<Option<Calibration>> {
        // ---
        let calibration = sqlx::query_as::<_, Calibration>(
            r#"
            SELECT id, probe_id, raw_dry, raw_wet, raw_min, raw_max, valid_from, valid_to
            FROM calibrations
            WHERE probe_id = $1
              AND valid_from <= $2
              AND (valid_to IS NULL OR $2 < valid_to)
            ORDER BY valid_from DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(probe_id)
        .bind(ts)
        .fetch_optional(&self.pool)
        .await?;
        Ok(calibration)
    }
}

#[derive(sqlx::FromRow)]
struct ThresholdRow {
    probe_id: i64,
    lux_min: Option<f64>,
    lux_max: Option<f64>,
    rh_min: Option<f64>,
    rh_max: Option<f64>,
    temp_c_min: Option<f64>,
    temp_c_max: Option<f64>,
    moisture_pct_min: Option<f64>,
    moisture_pct_max: Option<f64>,
    sustain_minutes: i32,
}

impl From<ThresholdRow> for ProbeThresholds {
    fn from(row: ThresholdRow) -> Self {
        Self {
            probe_id: row.probe_id,
            lux: Limits::new(row.lux_min, row.lux_max),
            rh: Limits::new(row.rh_min, row.rh_max),
            temp_c: Limits::new(row.temp_c_min, row.temp_c_max),
            moisture_pct: Limits::new(row.moisture_pct_min, row.moisture_pct_max),
            sustain_minutes: i64::from(row.sustain_minutes),
        }
    }
}

#[async_trait]
impl ThresholdRegistry for PgStore {
    // ---
    async fn thresholds(&self, probe_id: i64) -> Result<Option<ProbeThresholds>> {
        // ---
        let row = sqlx::query_as::<_, ThresholdRow>(
            r#"
            SELECT probe_id, lux_min, lux_max, rh_min, rh_max, temp_c_min, temp_c_max,
                   moisture_pct_min, moisture_pct_max, sustain_minutes
            FROM probe_thresholds
            WHERE probe_id = $1
            "#,
        )
        .bind(probe_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProbeThresholds::from))
    }
}

#[async_trait]
impl RollupStore for PgStore {
    // ---
    async fn load_cursor(&self, name: &str) -> Result<RollupCursor> {
        // ---
        let cursor = sqlx::query_as::<_, RollupCursor>(
            "SELECT name, last_cutoff, last_rev, last_run_at FROM rollup_cursors WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cursor.unwrap_or_else(|| RollupCursor::new(name)))
    }

    async fn save_cursor(&self, cursor: &RollupCursor) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO rollup_cursors (name, last_cutoff, last_rev, last_run_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                last_cutoff = EXCLUDED.last_cutoff,
                last_rev    = EXCLUDED.last_rev,
                last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(&cursor.name)
        .bind(cursor.last_cutoff)
        .bind(cursor.last_rev)
        .bind(cursor.last_run_at)
        .execute(&self.pool)
        .await
        .context("save rollup cursor")?;
        Ok(())
    }

    async fn max_rev(&self) -> Result<i64> {
        // ---
        // Only committed rows are visible here. A row whose rev was drawn
        // below this value but which commits after the following dirty scan
        // is missed if its bucket was already final; the next change to that
        // bucket, or a cursor reset, folds it in.
        let rev: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(rev), 0) FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(rev)
    }

    async fn dirty_buckets(&self, scan: &DirtyScan) -> Result<Vec<BucketKey>> {
        // ---
        // Rows that can matter: anything newer than last_rev, plus anything in
        // a bucket that may have become final since last_cutoff.
        let keys: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT probe_id, bucket_start
            FROM (
                SELECT probe_id,
                       to_timestamp(floor(extract(epoch FROM ts)::float8 / $1) * $1) AS bucket_start,
                       MAX(rev) AS max_rev
                FROM readings
                WHERE rev > $2
                   OR $3::timestamptz IS NULL
                   OR ts >= $3::timestamptz - make_interval(secs => $1)
                GROUP BY 1, 2
            ) b
            WHERE b.bucket_start + make_interval(secs => $1) <= $4
              AND (b.max_rev > $2
                   OR $3::timestamptz IS NULL
                   OR b.bucket_start + make_interval(secs => $1) > $3::timestamptz)
            ORDER BY bucket_start, probe_id
            "#,
        )
        .bind(scan.width_secs as f64)
        .bind(scan.last_rev)
        .bind(scan.last_cutoff)
        .bind(scan.cutoff)
        .fetch_all(&self.pool)
        .await
        .context("scan dirty rollup buckets")?;

        Ok(keys
            .into_iter()
            .map(|(probe_id, bucket_start)| BucketKey {
                probe_id,
                bucket_start,
            })
            .collect())
    }

    async fn readings_in_window(
        &self,
        probe_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        // ---
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM readings
            WHERE probe_id = $1 AND ts >= $2 AND ts < $3
            ORDER BY ts, id
            "#
        );
        let rows = sqlx::query_as::<_, Reading>(&sql)
            .bind(probe_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn upsert_bucket(&self, b: &RollupBucket) -> Result<()> {
        // ---
        let sql = format!(
            r#"
            INSERT INTO reading_rollups ({BUCKET_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            ON CONFLICT (probe_id, bucket_start) DO UPDATE SET
                width_secs       = EXCLUDED.width_secs,
                row_count        = EXCLUDED.row_count,
                lux_avg          = EXCLUDED.lux_avg,
                lux_min          = EXCLUDED.lux_min,
                lux_max          = EXCLUDED.lux_max,
                rh_avg           = EXCLUDED.rh_avg,
                rh_min           = EXCLUDED.rh_min,
                rh_max           = EXCLUDED.rh_max,
                temp_c_avg       = EXCLUDED.temp_c_avg,
                temp_c_min       = EXCLUDED.temp_c_min,
                temp_c_max       = EXCLUDED.temp_c_max,
                moisture_pct_avg = EXCLUDED.moisture_pct_avg,
                moisture_pct_min = EXCLUDED.moisture_pct_min,
                moisture_pct_max = EXCLUDED.moisture_pct_max,
                moisture_raw_avg = EXCLUDED.moisture_raw_avg,
                moisture_raw_min = EXCLUDED.moisture_raw_min,
                moisture_raw_max = EXCLUDED.moisture_raw_max,
                err_count        = EXCLUDED.err_count,
                updated_at       = EXCLUDED.updated_at
            "#
        );
        sqlx::query(&sql)
            .bind(b.probe_id)
            .bind(b.bucket_start)
            .bind(b.width_secs)
            .bind(b.count)
            .bind(b.lux_avg)
            .bind(b.lux_min)
            .bind(b.lux_max)
            .bind(b.rh_avg)
            .bind(b.rh_min)
            .bind(b.rh_max)
            .bind(b.temp_c_avg)
            .bind(b.temp_c_min)
            .bind(b.temp_c_max)
            .bind(b.moisture_pct_avg)
            .bind(b.moisture_pct_min)
            .bind(b.moisture_pct_max)
            .bind(b.moisture_raw_avg)
            .bind(b.moisture_raw_min)
            .bind(b.moisture_raw_max)
            .bind(b.err_count)
            .bind(b.updated_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("upsert bucket {} @ {}", b.probe_id, b.bucket_start))?;
        Ok(())
    }

    async fn buckets_in_range(&self, query: &RangeQuery) -> Result<Vec<RollupBucket>> {
        // ---
        let sql = format!(
            r#"
            SELECT {BUCKET_COLUMNS}
            FROM reading_rollups
            WHERE ($1::bigint IS NULL OR probe_id = $1)
              AND ($2::timestamptz IS NULL OR bucket_start >= $2)
              AND ($3::timestamptz IS NULL OR bucket_start <= $3)
            ORDER BY bucket_start {dir}, probe_id {dir}
            LIMIT $4
            "#,
            dir = order(query.oldest_first),
        );
        let rows = sqlx::query_as::<_, RollupBucket>(&sql)
            .bind(query.probe_id)
            .bind(query.start)
            .bind(query.end)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    probe_id: i64,
    rules: Json<BTreeMap<RuleId, RuleState>>,
    updated_at: DateTime<Utc>,
}

impl From<SnapshotRow> for AlertSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            probe_id: row.probe_id,
            rules: row.rules.0,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    probe_id: i64,
    rule: String,
    transition: String,
    value: Option<f64>,
    ts: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for AlertEvent {
    type Error = anyhow::Error;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Self {
            event_id: row.event_id,
            probe_id: row.probe_id,
            rule: row.rule.parse()?,
            transition: row.transition.parse()?,
            value: row.value,
            ts: row.ts,
            recorded_at: row.recorded_at,
        })
    }
}

#[async_trait]
impl AlertStore for PgStore {
    // ---
    async fn load_snapshot(&self, probe_id: i64) -> Result<Option<AlertSnapshot>> {
        // ---
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT probe_id, rules, updated_at FROM alert_snapshots WHERE probe_id = $1",
        )
        .bind(probe_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AlertSnapshot::from))
    }

    async fn save_snapshot(&self, snapshot: &AlertSnapshot, events: &[AlertEvent]) -> Result<()> {
        // ---
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO alert_snapshots (probe_id, rules, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (probe_id) DO UPDATE SET
                rules      = EXCLUDED.rules,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(snapshot.probe_id)
        .bind(Json(snapshot.rules.clone()))
        .bind(snapshot.updated_at)
        .execute(&mut *tx)
        .await
        .context("upsert alert snapshot")?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO alert_events (event_id, probe_id, rule, transition, value, ts, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(event.event_id)
            .bind(event.probe_id)
            .bind(event.rule.as_str())
            .bind(event.transition.as_str())
            .bind(event.value)
            .bind(event.ts)
            .bind(event.recorded_at)
            .execute(&mut *tx)
            .await
            .context("insert alert event")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn snapshots(&self) -> Result<Vec<AlertSnapshot>> {
        // ---
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT probe_id, rules, updated_at FROM alert_snapshots ORDER BY probe_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AlertSnapshot::from).collect())
    }

    async fn alert_events(&self, probe_id: Option<i64>, limit: i64) -> Result<Vec<AlertEvent>> {
        // ---
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, probe_id, rule, transition, value, ts, recorded_at
            FROM alert_events
            WHERE ($1::bigint IS NULL OR probe_id = $1)
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(probe_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AlertEvent::try_from).collect()
    }
}
