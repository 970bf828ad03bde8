//! Error handling for the REST API server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;

use waymark_core::WaymarkError;

/// Result type for route handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// API error type.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.status, self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = %self.code, "{}", self.message);
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<WaymarkError> for ApiError {
    fn from(err: WaymarkError) -> Self {
        let code = err.code().as_str();
        let message = err.to_string();
        let suggestion = err.suggestion().map(str::to_string);

        let (status, details) = match &err {
            WaymarkError::NotFound { element, .. } => {
                (StatusCode::NOT_FOUND, element.as_ref().map(|e| json!({ "element": e })))
            }
            WaymarkError::Conflict {
                element,
                expected,
                actual,
                ..
            } => (
                StatusCode::CONFLICT,
                element.map(|e| {
                    json!({
                        "element": e,
                        "expected_version": expected,
                        "actual_version": actual,
                    })
                }),
            ),
            WaymarkError::StillReferenced {
                element,
                referenced_by,
                ..
            } => (
                StatusCode::PRECONDITION_FAILED,
                Some(json!({ "element": element, "referenced_by": referenced_by })),
            ),
            WaymarkError::Validation { details, .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                (!details.is_empty()).then(|| json!(details)),
            ),
            WaymarkError::Parse { .. } | WaymarkError::Serialization(_) => {
                (StatusCode::BAD_REQUEST, None)
            }
            WaymarkError::Unavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
            WaymarkError::Database { .. }
            | WaymarkError::Configuration(_)
            | WaymarkError::Io(_)
            | WaymarkError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let details = match (details, suggestion) {
            (Some(mut details), Some(hint)) => {
                details["suggestion"] = json!(hint);
                Some(details)
            }
            (None, Some(hint)) => Some(json!({ "suggestion": hint })),
            (details, None) => details,
        };

        let mut error = ApiError::new(status, code, message);
        error.details = details;
        error
    }
}
