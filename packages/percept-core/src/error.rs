//! Centralized error types for the Percept Hub core library.
//!
//! Data-plane failures (bad records, bad viewers, a flapping segmentation
//! service) are logged and absorbed close to where they happen; the errors
//! here are the control-plane failures that get surfaced to HTTP callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the hub.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum HubError {
    /// Requested recording does not exist on disk.
    #[error("Recording not found: {0}")]
    RecordingNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Recording or sidecar I/O failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Segmentation service interaction failed.
    #[error("Segmentation service error: {0}")]
    Segmentation(String),

    /// Server configuration error (missing or inconsistent settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RecordingNotFound(_) => "recording_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Io(_) => "io_error",
            Self::Segmentation(_) => "segmentation_error",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RecordingNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenient Result alias for application-wide operations.
pub type HubResult<T> = Result<T, HubError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_not_found_maps_to_404() {
        let err = HubError::RecordingNotFound("walk.pb".into());
        assert_eq!(err.code(), "recording_not_found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_request_maps_to_400() {
        let err = HubError::InvalidRequest("missing filename".into());
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn io_errors_convert_with_message() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: HubError = io.into();
        assert_eq!(err.code(), "io_error");
        assert!(err.to_string().contains("gone"));
    }
}
