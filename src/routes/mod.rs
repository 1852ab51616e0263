//! Read API gateway (EMBP).
//!
//! Each sibling module exports a subrouter over the shared state; this
//! gateway merges them so `main.rs` only sees [`router`].

use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tracing::error;

use crate::models::parse_timestamp;
use crate::store::{RangeQuery, Store};
use crate::Config;

mod alerts;
mod health;
mod readings;
mod rollups;

// ---

/// State shared by every handler.
pub type AppState<S> = (Arc<S>, Config);

pub const DEFAULT_LIMIT: i64 = 1000;
pub const MAX_LIMIT: i64 = 5000;

pub fn router<S: Store>(store: Arc<S>, config: Config) -> Router {
    // ---
    Router::new()
        .merge(readings::router::<S>())
        .merge(rollups::router::<S>())
        .merge(alerts::router::<S>())
        .merge(health::router())
        .with_state((store, config))
}

/// `{"error": ...}` body with the given status.
fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    // ---
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn internal_error(context: &str, e: anyhow::Error) -> Response {
    // ---
    error!(error = %e, "{context} failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{context} failed"))
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or a full timestamp.
fn parse_query_ts(text: &str) -> Result<DateTime<Utc>, Response> {
    // ---
    let text = text.trim();
    if let Ok(day) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    parse_timestamp(text).ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, format!("Invalid date format: {text}"))
    })
}

/// Build a validated [`RangeQuery`] from raw query parameters.
fn range_query(
    probe_id: Option<i64>,
    start: Option<&str>,
    end: Option<&str>,
    limit: Option<i64>,
    oldest_first: Option<bool>,
) -> Result<RangeQuery, Response> {
    // ---
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {MAX_LIMIT}"),
        ));
    }

    let start = start.filter(|s| !s.is_empty()).map(parse_query_ts).transpose()?;
    let end = end.filter(|s| !s.is_empty()).map(parse_query_ts).transpose()?;

    Ok(RangeQuery {
        probe_id,
        start,
        end,
        limit,
        oldest_first: oldest_first.unwrap_or(true),
    })
}
