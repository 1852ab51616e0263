use axum::{
    extract::Query, extract::State, response::IntoResponse, response::Response, routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::{internal_error, range_query, AppState};
use crate::rollup::DEFAULT_CURSOR;
use crate::store::Store;

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    // ---
    Router::new()
        .route("/rollups", get(rollups::<S>))
        .route("/rollups/watermark", get(watermark::<S>))
}

#[derive(Debug, Deserialize)]
pub struct RollupsQuery {
    probe_id: Option<i64>,
    start: Option<String>,
    end: Option<String>,
    limit: Option<i64>,
    oldest_first: Option<bool>,
}

async fn rollups<S: Store>(
    Query(params): Query<RollupsQuery>,
    State((store, _config)): State<AppState<S>>,
) -> Response {
    // ---
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

    match store.buckets_in_range(&query).await {
        Ok(buckets) => Json(buckets).into_response(),
        Err(e) => internal_error("rollups query", e),
    }
}

/// Cursor of the built-in rollup worker; a stale `last_cutoff` means ticks
/// are failing.
async fn watermark<S: Store>(State((store, _config)): State<AppState<S>>) -> Response {
    // ---
    match store.load_cursor(DEFAULT_CURSOR).await {
        Ok(cursor) => Json(cursor).into_response(),
        Err(e) => internal_error("watermark query", e),
    }
}
