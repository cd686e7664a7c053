//! Thumbnail serving and cache management.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::errors::AppResult;
use crate::AppState;
use lumen_core::ThumbnailOutcome;

pub async fn get_thumbnail(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> AppResult<Response> {
    match state.thumbs.get_or_generate(&path).await? {
        ThumbnailOutcome::Ready(bytes) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/jpeg")
            .header(header::CACHE_CONTROL, "private, max-age=86400")
            .body(bytes.into())
            .expect("thumbnail response")),
        ThumbnailOutcome::Pending => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "pending" })),
        )
            .into_response()),
    }
}

pub async fn delete_thumbnail(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> AppResult<Json<Value>> {
    let removed = state.thumbs.invalidate(&path).await?;
    Ok(Json(json!({ "removed": removed })))
}

pub async fn thumbnails_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.thumbs.status()))
}

/// Drop the whole thumbnail cache and regenerate it in the background.
pub async fn rebuild_thumbnails(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let cleared = state.thumbs.clear().await?;
    info!("thumbnail rebuild requested, {cleared} entries dropped");
    tokio::spawn(Arc::clone(&state.thumbs).sweep());
    Ok(Json(json!({ "status": "rebuilding", "cleared": cleared })))
}
