//! `plantpipe`: probe telemetry ingestion, rollups and alerting.
//!
//! Module gateway (EMBP). The binary in `main.rs` only bootstraps; everything
//! it wires together is exported from here so integration tests can drive
//! the same pipeline against the in-memory store.

pub mod alerts;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod rollup;
pub mod routes;
pub mod schema;
pub mod store;

pub use config::Config;
pub use error::{DecodeError, RejectReason};
pub use ingest::{IngestOutcome, Ingestor};
pub use rollup::{RollupReport, RollupSettings};
pub use store::{MemoryStore, PgStore, Store};
