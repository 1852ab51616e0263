//! Application entry point for the `plantpipe` service.
//!
//! Startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the database schema if it does not exist
//! - Spawning the probe feed ingestor and the rollup worker
//! - Binding the Axum read API and serving until ctrl-c
//!
//! # Environment Variables
//! See [`plantpipe::config::load_from_env`]. Logging is controlled by
//! `RUST_LOG`, or else `PLANTPIPE_LOG_LEVEL` (default: `debug`) and
//! `PLANTPIPE_SPAN_EVENTS`.
use std::{env, io::IsTerminal, sync::Arc};

use anyhow::Result;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use plantpipe::config::{self, mask_db_url};
use plantpipe::ingest::source;
use plantpipe::{rollup, routes, schema, Ingestor, PgStore, RollupSettings};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", mask_db_url(&cfg.db_url));

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database '{}': {}",
                mask_db_url(&cfg.db_url),
                e
            )
        })?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let cancel = CancellationToken::new();

    let ingest_task = {
        let cfg = cfg.clone();
        let ingestor = Ingestor::new(Arc::clone(&store));
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = source::run(&cfg, ingestor, cancel.clone()).await {
                tracing::error!(error = %e, "ingest source failed");
                cancel.cancel();
            }
        })
    };

    let rollup_task = tokio::spawn(rollup::run_worker(
        Arc::clone(&store),
        RollupSettings::from_config(&cfg),
        cancel.clone(),
    ));

    tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));

    // Build app from routes gateway (EMBP)
    let app = routes::router(store, cfg.clone());

    tracing::info!("Listening on {}", cfg.http_addr);
    let listener = tokio::net::TcpListener::bind(cfg.http_addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    cancel.cancel();
    let (ingest, rollup) = tokio::join!(ingest_task, rollup_task);
    let clean = finished_cleanly("ingest", ingest) & finished_cleanly("rollup", rollup);
    tracing::info!(clean, "Shutdown complete");

    Ok(())
}

/// Log a worker that panicked or was aborted.
fn finished_cleanly(task: &str, joined: Result<(), JoinError>) -> bool {
    // ---
    match joined {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(task, error = %e, panicked = e.is_panic(), "worker task did not finish cleanly");
            false
        }
    }
}

async fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    // ---
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("ctrl-c received, shutting down"),
        Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c, shutting down"),
    }
    cancel.cancel();
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `PLANTPIPE_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `PLANTPIPE_LOG_LEVEL` env var
///
/// Call once at startup, before any logging macro runs.
fn init_tracing() {
    // ---
    let span_events = match env::var("PLANTPIPE_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to PLANTPIPE_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("PLANTPIPE_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
