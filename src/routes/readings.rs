use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, response::Response,
    routing::get, Json, Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{error_response, internal_error, parse_query_ts, range_query, AppState, MAX_LIMIT};
use crate::models::TS_FORMAT;
use crate::store::{RangeQuery, Store};

/// Widest window `GET /updated_within` accepts.
const MAX_WITHIN_SECS: i64 = 86_400;

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    // ---
    Router::new()
        .route("/readings", get(readings::<S>))
        .route("/latest_ts", get(latest_ts::<S>))
        .route("/count", get(count::<S>))
        .route("/last", get(last::<S>))
        .route("/updated_within", get(updated_within::<S>))
        .route("/has_updates_since", get(has_updates_since::<S>))
}

/// Query parameters for `GET /readings`.
#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    probe_id: Option<i64>,
    /// `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`, UTC, inclusive.
    start: Option<String>,
    end: Option<String>,
    limit: Option<i64>,
    oldest_first: Option<bool>,
}

async fn readings<S: Store>(
    Query(params): Query<ReadingsQuery>,
    State((store, _config)): State<AppState<S>>,
) -> Response {
    // ---
    debug!("GET /readings {:?}", params);

    let query = match range_query(
        params.probe_id,
        params.start.as_deref(),
        params.end.as_deref(),
        params.limit,
        params.oldest_first,
    ) {
        Ok(query) => query,
        Err(response) => return response,
    };

    match store.readings_in_range(&query).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => internal_error("readings query", e),
    }
}

async fn latest_ts<S: Store>(State((store, _config)): State<AppState<S>>) -> Response {
    // ---
    match store.latest_ts().await {
        Ok(ts) => {
            let ts = ts.map(|ts| ts.format(TS_FORMAT).to_string());
            Json(json!({ "ts": ts })).into_response()
        }
        Err(e) => internal_error("latest_ts query", e),
    }
}

async fn count<S: Store>(State((store, _config)): State<AppState<S>>) -> Response {
    // ---
    match store.reading_count().await {
        Ok(count) => Json(json!({ "count": count })).into_response(),
        Err(e) => internal_error("count query", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LastQuery {
    n: Option<i64>,
    oldest_first: Option<bool>,
}

/// The newest `n` readings, returned oldest first unless asked otherwise.
async fn last<S: Store>(
    Query(params): Query<LastQuery>,
    State((store, _config)): State<AppState<S>>,
) -> Response {
    // ---
    let n = params.n.unwrap_or(1);
    if !(1..=MAX_LIMIT).contains(&n) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("n must be between 1 and {MAX_LIMIT}"),
        );
    }

    let query = RangeQuery {
        limit: n,
        oldest_first: false,
        ..RangeQuery::default()
    };
    match store.readings_in_range(&query).await {
        Ok(mut rows) => {
            if params.oldest_first.unwrap_or(true) {
                rows.reverse();
            }
            Json(rows).into_response()
        }
        Err(e) => internal_error("last readings query", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct WithinQuery {
    seconds: Option<i64>,
}

async fn updated_within<S: Store>(
    Query(params): Query<WithinQuery>,
    State((store, _config)): State<AppState<S>>,
) -> Response {
    // ---
    let Some(seconds) = params.seconds.filter(|s| (1..=MAX_WITHIN_SECS).contains(s)) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("seconds must be between 1 and {MAX_WITHIN_SECS}"),
        );
    };

    match store.has_readings_after(Utc::now() - Duration::seconds(seconds)).await {
        Ok(updated) => Json(json!({ "updated": updated })).into_response(),
        Err(e) => internal_error("updated_within query", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    ts: Option<String>,
}

async fn has_updates_since<S: Store>(
    Query(params): Query<SinceQuery>,
    State((store, _config)): State<AppState<S>>,
) -> Response {
    // ---
    let Some(text) = params.ts.filter(|t| !t.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "ts is required");
    };
    let since = match parse_query_ts(&text) {
        Ok(since) => since,
        Err(response) => return response,
    };

    match store.has_readings_after(since).await {
        Ok(updated) => Json(json!({ "updated": updated })).into_response(),
        Err(e) => internal_error("has_updates_since query", e),
    }
}
