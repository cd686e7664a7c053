//! API route table.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{admin, files, stream, thumbs};
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        // Library browsing
        .route("/api/files", get(files::list_files))
        .route("/api/media", get(files::list_media))
        .route("/api/file/{*path}", get(files::get_file))
        // Search
        .route("/api/search", get(files::search))
        .route("/api/search/suggestions", get(files::suggestions))
        .route("/api/stats", get(files::stats))
        // Thumbnails
        .route(
            "/api/thumbnail/{*path}",
            get(thumbs::get_thumbnail).delete(thumbs::delete_thumbnail),
        )
        .route("/api/thumbnails/status", get(thumbs::thumbnails_status))
        .route("/api/thumbnails/rebuild", post(thumbs::rebuild_thumbnails))
        // Streaming and transcodes
        .route("/api/stream/{*path}", get(stream::stream))
        .route("/api/stream-info/{*path}", get(stream::stream_info))
        .route("/api/transcode/{*path}", delete(stream::delete_transcode))
        .route("/api/transcodes/status", get(stream::transcodes_status))
        .route("/api/transcodes/clear", post(stream::clear_transcodes))
        // Index control and probes
        .route("/api/reindex", post(admin::reindex))
        .route("/healthz", get(admin::healthz))
        .route("/readyz", get(admin::readyz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
