//! JSend envelopes for the HTTP API.
//!
//! `success` wraps handler output in `data`, `fail` carries a client error
//! under `data.message` and `error` carries a server error in `message`.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::shard::ShardCallError;
use crate::upload::FileServiceError;

#[derive(Debug, Serialize)]
pub struct JSend<T: Serialize> {
    status: &'static str,
    pub data: T,
}

impl<T: Serialize> JSend<T> {
    pub fn success(data: T) -> Json<JSend<T>> {
        Json(JSend {
            status: "success",
            data,
        })
    }
}

/// Offset pagination of an owner's file listing.
#[derive(Debug, Serialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u64,
    pub total: u64,
    pub total_pages: u64,
}

#[derive(Debug, Serialize)]
pub struct Page<T: Serialize> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

pub type JSendPaginated<T> = JSend<Page<T>>;

impl<T: Serialize> JSend<Page<T>> {
    pub fn page(items: Vec<T>, pagination: Pagination) -> Json<JSendPaginated<T>> {
        JSend::success(Page { items, pagination })
    }
}

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Failure<'a> {
    Fail { data: Message<'a> },
    Error { message: &'a str },
}

/// Handler error. 4xx statuses render as JSend `fail`, 5xx as `error`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// The file exists but its content was destroyed by quarantine.
    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.status.is_server_error() {
            Failure::Error {
                message: &self.message,
            }
        } else {
            Failure::Fail {
                data: Message {
                    message: &self.message,
                },
            }
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<FileServiceError> for ApiError {
    fn from(e: FileServiceError) -> Self {
        match e {
            FileServiceError::InvalidOwner(_) | FileServiceError::EmptyFile(_) => {
                ApiError::bad_request(e.to_string())
            }
            FileServiceError::NotFound(_) => ApiError::not_found("File not found"),
            FileServiceError::Quarantined(_) => {
                ApiError::gone("File was quarantined by the malware scan")
            }
            FileServiceError::Metadata(ShardCallError::DeadlineExceeded { .. }) => {
                ApiError::unavailable(e.to_string())
            }
            _ => {
                tracing::error!(error = %e, "File operation failed");
                ApiError::internal(e.to_string())
            }
        }
    }
}

/// `Query` extractor backed by serde_qs that rejects with a JSend `fail`.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, ApiError> {
        serde_qs::from_str(parts.uri.query().unwrap_or_default())
            .map(AppQuery)
            .map_err(|e| ApiError::bad_request(query_error(&e.to_string())))
    }
}

fn query_error(raw: &str) -> String {
    let readable = raw
        .replace("u32", "non-negative integer")
        .replace("u64", "non-negative integer");
    format!("Invalid query parameter: {readable}")
}
