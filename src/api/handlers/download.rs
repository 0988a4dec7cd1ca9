use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::api::auth::OwnerId;
use crate::api::response::ApiError;
use crate::AppState;

/// Serve a file's content as an attachment.
/// Route: GET /files/:id/download
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (file, data) = state.files.download(&owner_id, &id).await?;

    let content_length = data.len() as u64;
    let mut response = (StatusCode::OK, data).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        file.mime_type
            .parse()
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));

    // Quotes and control characters cannot appear inside the quoted filename.
    let filename: String = file
        .original_name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    // Content belongs to one owner and may be quarantined later.
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, no-store"),
    );

    Ok(response)
}
