//! Index triggering and liveness/readiness probes.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::info;

use crate::AppState;

pub async fn reindex(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    info!("reindex requested over the API");
    state.indexer.trigger_index();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "scheduled" })),
    )
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn readyz(State(state): State<AppState>) -> Response {
    if state.indexer.is_ready() {
        Json(json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "indexing" })),
        )
            .into_response()
    }
}
