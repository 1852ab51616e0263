use axum::{
    extract::Path, extract::Query, extract::State, http::StatusCode, response::IntoResponse,
    response::Response, routing::get, Json, Router,
};
use serde::Deserialize;

use super::{error_response, internal_error, AppState, DEFAULT_LIMIT, MAX_LIMIT};
use crate::store::Store;

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    // ---
    Router::new()
        .route("/alerts", get(snapshots::<S>))
        .route("/alerts/{probe_id}", get(snapshot::<S>))
        .route("/alert_events", get(events::<S>))
}

async fn snapshots<S: Store>(State((store, _config)): State<AppState<S>>) -> Response {
    // ---
    match store.snapshots().await {
        Ok(all) => Json(all).into_response(),
        Err(e) => internal_error("alert snapshots query", e),
    }
}

async fn snapshot<S: Store>(
    Path(probe_id): Path<i64>,
    State((store, _config)): State<AppState<S>>,
) -> Response {
    // ---
    match store.load_snapshot(probe_id).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("no alert state for probe {probe_id}"),
        ),
        Err(e) => internal_error("alert snapshot query", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    probe_id: Option<i64>,
    limit: Option<i64>,
}

/// Newest first.
async fn events<S: Store>(
    Query(params): Query<EventsQuery>,
    State((store, _config)): State<AppState<S>>,
) -> Response {
    // ---
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {MAX_LIMIT}"),
        );
    }

    match store.alert_events(params.probe_id, limit).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => internal_error("alert events query", e),
    }
}
