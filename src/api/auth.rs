use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::response::ApiError;

/// Header carrying the caller's identity, set by the gateway after it has
/// verified the request's credentials.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated owner of the request. Trusted as-is.
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| OwnerId(value.to_string()))
            .ok_or_else(|| ApiError::unauthorized("Missing X-User-Id header"))
    }
}
