//! Configuration loader for the `plantpipe` service.
//!
//! All runtime settings come from environment variables (with optional `.env`
//! support provided by the caller) and are parsed once here into an
//! immutable [`Config`], so the rest of the crate never calls `env::var`.
//!
use std::env;
use std::net::SocketAddr;

use anyhow::{anyhow, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

macro_rules! parse_env_u64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional socket address environment variable with a default.
macro_rules! parse_env_addr {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .unwrap_or_else(|_| $default.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Where raw probe lines come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Tcp,
    Stdin,
}

impl std::str::FromStr for IngestSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(IngestSource::Tcp),
            "stdin" => Ok(IngestSource::Stdin),
            other => Err(anyhow!("Invalid INGEST_SOURCE: '{other}' (expected tcp or stdin)")),
        }
    }
}

/// Strongly typed application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Read API bind address.
    pub http_addr: SocketAddr,

    /// Probe feed bind address (TCP source only).
    pub ingest_addr: SocketAddr,

    pub ingest_source: IngestSource,

    /// Rollup bucket width.
    pub rollup_bucket_secs: u64,

    /// How long a bucket stays open for late readings.
    pub rollup_grace_secs: u64,

    pub rollup_tick_secs: u64,

    /// Rows examined per backfill pass.
    pub backfill_batch: u32,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `HTTP_ADDR` – read API address (default: `0.0.0.0:8080`)
/// - `INGEST_ADDR` – probe feed address (default: `0.0.0.0:7070`)
/// - `INGEST_SOURCE` – `tcp` or `stdin` (default: `tcp`)
/// - `ROLLUP_BUCKET_SECS` (300), `ROLLUP_GRACE_SECS` (120), `ROLLUP_TICK_SECS` (60)
/// - `BACKFILL_BATCH` (500)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let http_addr = parse_env_addr!("HTTP_ADDR", "0.0.0.0:8080");
    let ingest_addr = parse_env_addr!("INGEST_ADDR", "0.0.0.0:7070");
    let ingest_source = env::var("INGEST_SOURCE")
        .unwrap_or_else(|_| "tcp".into())
        .parse::<IngestSource>()?;
    let rollup_bucket_secs = parse_env_u64!("ROLLUP_BUCKET_SECS", 300);
    let rollup_grace_secs = parse_env_u64!("ROLLUP_GRACE_SECS", 120);
    let rollup_tick_secs = parse_env_u64!("ROLLUP_TICK_SECS", 60);
    let backfill_batch = parse_env_u32!("BACKFILL_BATCH", 500);

    if rollup_bucket_secs == 0 {
        return Err(anyhow!("Invalid ROLLUP_BUCKET_SECS: must be positive"));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        http_addr,
        ingest_addr,
        ingest_source,
        rollup_bucket_secs,
        rollup_grace_secs,
        rollup_tick_secs,
        backfill_batch,
    })
}

/// Replace the password in a connection URL with `****`.
pub fn mask_db_url(url: &str) -> String {
    // ---
    let Some(at_pos) = url.rfind('@') else {
        return url.to_string();
    };
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    match url[scheme_end + 3..at_pos].find(':') {
        Some(colon) => {
            let colon_pos = scheme_end + 3 + colon;
            format!("{}:****{}", &url[..colon_pos], &url[at_pos..])
        }
        None => url.to_string(),
    }
}

impl Config {
    /// Log the loaded configuration with the database password masked.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL       : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX        : {}", self.db_pool_max);
        tracing::info!("  HTTP_ADDR          : {}", self.http_addr);
        tracing::info!("  INGEST_ADDR        : {}", self.ingest_addr);
        tracing::info!("  INGEST_SOURCE      : {:?}", self.ingest_source);
        tracing::info!("  ROLLUP_BUCKET_SECS : {}", self.rollup_bucket_secs);
        tracing::info!("  ROLLUP_GRACE_SECS  : {}", self.rollup_grace_secs);
        tracing::info!("  ROLLUP_TICK_SECS   : {}", self.rollup_tick_secs);
        tracing::info!("  BACKFILL_BATCH     : {}", self.backfill_batch);
    }

    /// Defaults for everything except the database, for tests and tools.
    pub fn with_db_url(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            db_pool_max: 5,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ingest_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            ingest_source: IngestSource::Tcp,
            rollup_bucket_secs: 300,
            rollup_grace_secs: 120,
            rollup_tick_secs: 60,
            backfill_batch: 500,
        }
    }
}
