//! Structured errors for the prerender server.
//!
//! Every variant maps to the HTTP status the client sees.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use prerender_client::RenderError;

/// Body sent when a render exceeds its deadline.
pub const TIMEOUT_BODY: &str = "Timeout: The page that should be rendered is too slow!";

/// Structured errors for the prerender server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Target rejected before any render attempt.
    #[error("RESTRICTED_URL: {0}")]
    RestrictedUrl(String),

    #[error("RENDER_TIMEOUT: {0}ms")]
    RenderTimeout(u64),

    /// The page exposed privileged metadata.
    #[error("RENDER_FORBIDDEN")]
    RenderForbidden,

    #[error("RENDER_EMPTY_RESPONSE: {0}")]
    RenderEmptyResponse(String),

    /// The page rendered its "not found" view.
    #[error("NOT_FOUND_VIEW")]
    NotFoundView,

    #[error("RENDER_FAILED: {0}")]
    RenderFailed(String),

    #[error("CACHE_ERROR: {0}")]
    Cache(#[from] prerender_core::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::RestrictedUrl(_) | ServerError::RenderForbidden => StatusCode::FORBIDDEN,
            ServerError::RenderTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            ServerError::RenderEmptyResponse(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFoundView => StatusCode::NOT_FOUND,
            ServerError::RenderFailed(_) | ServerError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Screenshots only distinguish forbidden targets from failures.
    pub fn for_screenshot(self) -> Self {
        match self {
            ServerError::RestrictedUrl(_) | ServerError::RenderForbidden => self,
            other => ServerError::RenderFailed(other.to_string()),
        }
    }

    /// Plain text body shown to the client.
    pub fn body(&self) -> String {
        match self {
            ServerError::RenderTimeout(_) => TIMEOUT_BODY.to_string(),
            ServerError::RestrictedUrl(_) | ServerError::RenderForbidden => "Forbidden".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<RenderError> for ServerError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Timeout(ms) => ServerError::RenderTimeout(ms),
            RenderError::Forbidden => ServerError::RenderForbidden,
            RenderError::EmptyResponse => ServerError::RenderEmptyResponse("no response".to_string()),
            RenderError::InvalidTimezone(tz) => ServerError::RenderEmptyResponse(format!("invalid timezone id: {tz}")),
            RenderError::NotFoundView => ServerError::NotFoundView,
            other => ServerError::RenderFailed(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status(), self.body()).into_response()
    }
}
