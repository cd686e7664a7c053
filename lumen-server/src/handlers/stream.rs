//! Video streaming: probe info, cached or live transcoded MP4, and
//! transcode-cache management.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Json, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use super::files::serve_file_ranged;
use crate::errors::{AppError, AppResult};
use crate::transcoding::StreamSource;
use crate::AppState;
use lumen_core::types::MediaKind;
use lumen_core::FileRecord;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Target width; 0 or absent keeps the source width.
    pub w: Option<u32>,
}

async fn video_record(state: &AppState, path: &str) -> AppResult<FileRecord> {
    let record = state
        .store
        .get_file_by_path(path)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no such file: {path}")))?;
    if record.kind != MediaKind::Video {
        return Err(AppError::bad_request("streaming is for videos"));
    }
    Ok(record)
}

pub async fn stream_info(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> AppResult<Json<Value>> {
    let record = video_record(&state, &path).await?;
    let abs = state.config.media_dir.join(&record.path);
    let info = state.prober.probe(&abs).await?;
    Ok(Json(json!(info)))
}

pub async fn stream(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let record = video_record(&state, &path).await?;
    let abs = state.config.media_dir.join(&record.path);
    let target_width = query.w.unwrap_or(0);

    let info = state.prober.probe(&abs).await?;
    match state
        .transcoder
        .get_or_start(&abs, target_width, &info)
        .await?
    {
        StreamSource::Cached(cached) => {
            // Complete file: Content-Length and range support come for free.
            serve_file_ranged(&cached, "video/mp4", &headers).await
        }
        StreamSource::Live(rx) => {
            info!("serving live transcode of {path} (w={target_width})");
            let stream =
                ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "video/mp4")
                .header(header::CACHE_CONTROL, "no-store")
                .body(axum::body::Body::from_stream(stream))
                .map_err(|e| AppError::internal(e.to_string()))
        }
    }
}

pub async fn delete_transcode(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> AppResult<Json<Value>> {
    let record = video_record(&state, &path).await?;
    let abs = state.config.media_dir.join(&record.path);
    let removed = state.transcoder.invalidate(&abs).await?;
    Ok(Json(json!({ "removed": removed })))
}

pub async fn transcodes_status(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let status = state.transcoder.status().await?;
    Ok(Json(json!(status)))
}

pub async fn clear_transcodes(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let removed = state.transcoder.clear().await?;
    Ok(Json(json!({ "removed": removed })))
}
