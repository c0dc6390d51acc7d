//! HTTP error mapping.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, error};

use codekb_shared::CodeKbError;

/// Error returned by handlers, rendered as `{ "success": false, "error": ... }`.
#[derive(Debug)]
pub struct ApiError(pub CodeKbError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CodeKbError::NotFound { .. } => StatusCode::NOT_FOUND,
            CodeKbError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            CodeKbError::CapacityExceeded { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CodeKbError> for ApiError {
    fn from(err: CodeKbError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(CodeKbError::invalid_argument(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.0.to_string();
        if self.0.is_client_error() {
            debug!(status = status.as_u16(), error = %message, "request rejected");
        } else {
            error!(status = status.as_u16(), error = %message, "request failed");
        }
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}
