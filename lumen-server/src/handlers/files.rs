//! Directory listings, raw file serving, search, and stats.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::AppState;
use lumen_core::types::MediaKind;

const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: String,
    pub page: Option<u32>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<u32>,
}

pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Value>> {
    let page = state
        .store
        .list_directory(
            &query.path,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(json!(page)))
}

pub async fn list_media(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Value>> {
    let page = state
        .store
        .list_media(
            &query.path,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(json!(page)))
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let record = state
        .store
        .get_file_by_path(&path)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no such file: {path}")))?;
    if record.kind == MediaKind::Folder {
        return Err(AppError::bad_request("cannot serve a folder"));
    }

    let abs = state.config.media_dir.join(&record.path);
    serve_file_ranged(&abs, &record.mime, &headers).await
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    pub limit: Option<u32>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Value>> {
    if query.q.trim().is_empty() {
        return Ok(Json(json!({ "items": [] })));
    }
    let items = state
        .store
        .search(query.q.trim(), query.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!({ "items": items })))
}

pub async fn suggestions(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Value>> {
    if query.q.trim().is_empty() {
        return Ok(Json(json!({ "suggestions": [] })));
    }
    let suggestions = state
        .store
        .search_suggestions(query.q.trim(), query.limit.unwrap_or(10))
        .await?;
    Ok(Json(json!({ "suggestions": suggestions })))
}

pub async fn stats(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let snapshot = state.store.get_stats().await?;
    Ok(Json(json!({
        "stats": snapshot,
        "progress": state.indexer.progress(),
    })))
}

/// Serve a file whole or as a single byte range, streaming either way.
pub(crate) async fn serve_file_ranged(
    path: &std::path::Path,
    content_type: &str,
    headers: &HeaderMap,
) -> AppResult<Response> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        warn!("file missing on disk: {} ({e})", path.display());
        AppError::not_found("file not available on disk")
    })?;
    let file_size = meta.len();

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AppError::internal(format!("could not open {}: {e}", path.display())))?;

    if let Some(range) = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range_header(v, file_size))
    {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        debug!("range request: {}-{}/{}", range.start, range.end, file_size);
        let mut file = file;
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| AppError::internal(format!("seek failed: {e}")))?;

        let content_length = range.end - range.start + 1;
        let stream = ReaderStream::new(file.take(content_length));

        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, content_length.to_string())
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, file_size),
            )
            .header(header::ACCEPT_RANGES, "bytes")
            .body(axum::body::Body::from_stream(stream))
            .map_err(|e| AppError::internal(e.to_string()));
    }

    let stream = ReaderStream::new(file);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, file_size.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .body(axum::body::Body::from_stream(stream))
        .map_err(|e| AppError::internal(e.to_string()))
}

#[derive(Debug, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

fn parse_range_header(range_str: &str, file_size: u64) -> Option<ByteRange> {
    let range_part = range_str.strip_prefix("bytes=")?;
    let (start_str, end_str) = range_part.split_once('-')?;

    let start = if start_str.is_empty() {
        // Suffix form: the last N bytes.
        let suffix_len = end_str.parse::<u64>().ok()?;
        return if suffix_len == 0 || file_size == 0 {
            None
        } else {
            Some(ByteRange {
                start: file_size.saturating_sub(suffix_len),
                end: file_size - 1,
            })
        };
    } else {
        start_str.parse::<u64>().ok()?
    };

    let end = if end_str.is_empty() {
        file_size.saturating_sub(1)
    } else {
        end_str.parse::<u64>().ok()?.min(file_size.saturating_sub(1))
    };

    if start <= end && start < file_size {
        Some(ByteRange { start, end })
    } else {
        None
    }
}
