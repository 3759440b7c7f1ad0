//! HTTP mapping of service errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use profsage_core::Error;
use tracing::{error, warn};

/// Error returned by handlers before any body bytes are sent.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::EmptyConversation => StatusCode::BAD_REQUEST,
            Error::MissingCredential(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Embedding(_) | Error::VectorIndex(_) | Error::Generation(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Config(_) | Error::Io(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Rejected request: {}", self.0);
        }

        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}
