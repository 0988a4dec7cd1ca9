use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::auth::OwnerId;
use crate::api::response::{ApiError, AppQuery, JSend, JSendPaginated, Pagination};
use crate::storage::models::{FileRecord, MimeCategory, OwnerUsage, ScanStatus};
use crate::upload::validate_owner_id;
use crate::AppState;

const MAX_PAGE_SIZE: u32 = 500;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub download_url: String,
    pub id: String,
    pub mime_category: MimeCategory,
    pub mime_type: String,
    pub original_name: String,
    pub owner_id: String,
    pub scan_status: ScanStatus,
    pub scanned_at: Option<String>,
    pub size_bytes: u64,
    pub uploaded_at: String,
}

/// Outcome for one file of a multipart upload.
#[derive(Debug, Serialize)]
pub struct UploadResult {
    pub original_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub uploaded: usize,
    pub failed: usize,
    pub results: Vec<UploadResult>,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u32 {
    50
}

// ============================================================================
// Handlers
// ============================================================================

/// Accepts one or more parts named `file` or `files`.
pub async fn upload_files(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<JSend<UploadResponse>>), ApiError> {
    validate_owner_id(&owner_id)?;

    let mut results = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        if !matches!(field.name(), Some("file") | Some("files")) {
            continue;
        }

        let original_name = field
            .file_name()
            .filter(|name| !name.is_empty())
            .unwrap_or("upload")
            .to_string();
        let content_type = field.content_type().map(|s| s.to_string());

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;

        if data.len() as u64 > state.config.max_upload_size {
            return Err(ApiError::payload_too_large(format!(
                "File exceeds maximum upload size of {} bytes",
                state.config.max_upload_size
            )));
        }

        let result = match state
            .files
            .upload(&owner_id, &original_name, content_type.as_deref(), data)
            .await
        {
            Ok(record) => UploadResult {
                original_name,
                file: Some(file_to_response(&record)),
                error: None,
            },
            Err(e) => {
                tracing::warn!(owner_id = %owner_id, file = %original_name, error = %e, "Upload failed");
                UploadResult {
                    original_name,
                    file: None,
                    error: Some(e.to_string()),
                }
            }
        };
        results.push(result);
    }

    if results.is_empty() {
        return Err(ApiError::bad_request("file field is required"));
    }

    let uploaded = results.iter().filter(|r| r.file.is_some()).count();
    let response = UploadResponse {
        uploaded,
        failed: results.len() - uploaded,
        results,
    };

    let status = if uploaded > 0 {
        StatusCode::CREATED
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, JSend::success(response)))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.files.get(&owner_id, &id).await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.files.delete(&owner_id, &id).await?;
    Ok(JSend::success(()))
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }
    let limit = params.limit.min(MAX_PAGE_SIZE);

    let page = state.files.list(&owner_id, limit, params.offset).await?;
    let items = page.files.iter().map(file_to_response).collect();

    Ok(JSendPaginated::page(
        items,
        Pagination {
            limit,
            offset: params.offset,
            total: page.total,
            total_pages: page.total_pages,
        },
    ))
}

/// File count and bytes stored for the calling owner.
pub async fn file_stats(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
) -> Result<Json<JSend<OwnerUsage>>, ApiError> {
    Ok(JSend::success(state.files.usage(&owner_id).await?))
}

// ============================================================================
// Helpers
// ============================================================================

fn file_to_response(file: &FileRecord) -> FileResponse {
    FileResponse {
        download_url: format!("/files/{}/download", file.id),
        id: file.id.clone(),
        mime_category: file.mime_category,
        mime_type: file.mime_type.clone(),
        original_name: file.original_name.clone(),
        owner_id: file.owner_id.clone(),
        scan_status: file.scan_status,
        scanned_at: file.scanned_at.map(|t| t.to_rfc3339()),
        size_bytes: file.size_bytes,
        uploaded_at: file.uploaded_at.to_rfc3339(),
    }
}
