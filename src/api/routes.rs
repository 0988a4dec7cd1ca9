use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Multipart framing on top of the largest allowed file.
    let upload_limit = (state.config.max_upload_size as usize).saturating_add(64 * 1024);

    Router::new()
        // Files
        .route("/files", get(handlers::list_files))
        .route(
            "/files",
            post(handlers::upload_files).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files/stats", get(handlers::file_stats))
        .route(
            "/files/:id",
            get(handlers::get_file).delete(handlers::delete_file),
        )
        .route("/files/:id/download", get(handlers::download_file))
        // Internal
        .route("/_internal/health", get(handlers::health))
        .route("/_internal/stats", get(handlers::global_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
