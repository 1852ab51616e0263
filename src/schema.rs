//! Database schema management for `plantpipe`.
//!
//! Ensures required tables and indexes exist before ingesting or serving.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

const STATEMENTS: &[&str] = &[
    // Change counter shared by inserts and backfill updates; drives rollups.
    "CREATE SEQUENCE IF NOT EXISTS readings_rev_seq",
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        id              BIGSERIAL PRIMARY KEY,
        rev             BIGINT           NOT NULL DEFAULT nextval('readings_rev_seq'),
        probe_id        BIGINT           NOT NULL,
        ts              TIMESTAMPTZ      NOT NULL,
        seq             BIGINT,
        lux             DOUBLE PRECISION,
        rh              DOUBLE PRECISION,
        temp_c          DOUBLE PRECISION,
        moisture_raw    INTEGER          NOT NULL,
        moisture_pct    DOUBLE PRECISION,
        calibration_id  BIGINT,
        err             TEXT,
        raw             TEXT,
        received_at     TIMESTAMPTZ      NOT NULL DEFAULT now()
    )
    "#,
    "ALTER TABLE readings ADD COLUMN IF NOT EXISTS raw TEXT",
    // Dedup key; NULL seq values never collide.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_readings_probe_ts_seq
        ON readings (probe_id, ts, seq)
    "#,
    "CREATE INDEX IF NOT EXISTS idx_readings_ts ON readings (ts)",
    "CREATE INDEX IF NOT EXISTS idx_readings_rev ON readings (rev)",
    r#"
    CREATE INDEX IF NOT EXISTS idx_readings_uncalibrated
        ON readings (id) WHERE calibration_id IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id           BIGSERIAL PRIMARY KEY,
        received_at  TIMESTAMPTZ NOT NULL,
        line         TEXT        NOT NULL,
        reason       TEXT        NOT NULL,
        detail       TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS calibrations (
        id          BIGSERIAL PRIMARY KEY,
        probe_id    BIGINT      NOT NULL,
        raw_dry     INTEGER     NOT NULL,
        raw_wet     INTEGER     NOT NULL,
        raw_min     INTEGER,
        raw_max     INTEGER,
        valid_from  TIMESTAMPTZ NOT NULL,
        valid_to    TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_calibrations_probe
        ON calibrations (probe_id, valid_from DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS probe_thresholds (
        probe_id          BIGINT PRIMARY KEY,
        lux_min           DOUBLE PRECISION,
        lux_max           DOUBLE PRECISION,
        rh_min            DOUBLE PRECISION,
        rh_max            DOUBLE PRECISION,
        temp_c_min        DOUBLE PRECISION,
        temp_c_max        DOUBLE PRECISION,
        moisture_pct_min  DOUBLE PRECISION,
        moisture_pct_max  DOUBLE PRECISION,
        sustain_minutes   INTEGER NOT NULL DEFAULT 30
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reading_rollups (
        probe_id          BIGINT           NOT NULL,
        bucket_start      TIMESTAMPTZ      NOT NULL,
        width_secs        BIGINT           NOT NULL,
        row_count         BIGINT           NOT NULL,
        lux_avg           DOUBLE PRECISION,
        lux_min           DOUBLE PRECISION,
        lux_max           DOUBLE PRECISION,
        rh_avg            DOUBLE PRECISION,
        rh_min            DOUBLE PRECISION,
        rh_max            DOUBLE PRECISION,
        temp_c_avg        DOUBLE PRECISION,
        temp_c_min        DOUBLE PRECISION,
        temp_c_max        DOUBLE PRECISION,
        moisture_pct_avg  DOUBLE PRECISION,
        moisture_pct_min  DOUBLE PRECISION,
        moisture_pct_max  DOUBLE PRECISION,
        moisture_raw_avg  DOUBLE PRECISION,
        moisture_raw_min  DOUBLE PRECISION,
        moisture_raw_max  DOUBLE PRECISION,
        err_count         BIGINT           NOT NULL,
        updated_at        TIMESTAMPTZ      NOT NULL,
        PRIMARY KEY (probe_id, bucket_start)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rollup_cursors (
        name         TEXT PRIMARY KEY,
        last_cutoff  TIMESTAMPTZ,
        last_rev     BIGINT NOT NULL DEFAULT 0,
        last_run_at  TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alert_snapshots (
        probe_id    BIGINT PRIMARY KEY,
        rules       JSONB       NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alert_events (
        id           BIGSERIAL PRIMARY KEY,
        event_id     UUID        NOT NULL UNIQUE,
        probe_id     BIGINT      NOT NULL,
        rule         TEXT        NOT NULL,
        transition   TEXT        NOT NULL,
        value        DOUBLE PRECISION,
        ts           TIMESTAMPTZ NOT NULL,
        recorded_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_alert_events_probe
        ON alert_events (probe_id, id DESC)
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist. Everything
/// runs in one transaction.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::debug!(statements = STATEMENTS.len(), "schema ensured");
    Ok(())
}
