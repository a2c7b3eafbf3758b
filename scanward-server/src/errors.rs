use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::fmt;

use scanward_core::ScanwardError;

pub type AppResult<T> = Result<T, AppError>;

/// Error answered to API clients as
/// `{"status":"error","error":{"code":..,"message":..,"details":..}}`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: &'static str,
    pub details: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: &'static str) -> Self {
        Self {
            status,
            code,
            message,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn unsupported_content_type() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "NOT_SUPPORTED_CONTENT_TYPE",
            "Not supported Content-Type",
        )
    }

    pub fn invalid_json() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_JSON", "Invalid JSON data")
    }

    pub fn invalid_url_format() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_URL_FORMAT", "Invalid url format")
    }

    pub fn nothing_to_process() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "NOTHING_TO_PROCESS", "Nothing to process")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", "Forbidden")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "OBJECT_NOT_FOUND", "Object not found")
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Internal server error",
        )
    }

    pub fn service_not_available() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_NOT_AVAILABLE",
            "Service not available",
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        let body = Json(json!({
            "status": "error",
            "error": error,
        }));

        (self.status, body).into_response()
    }
}

impl From<ScanwardError> for AppError {
    fn from(err: ScanwardError) -> Self {
        match err {
            ScanwardError::NotFound(_) => Self::not_found(),
            other => {
                tracing::error!(error = %other, "request failed");
                Self::internal().with_details(other.to_string())
            }
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        tracing::error!(error = %err, "unable to spool upload");
        Self::internal().with_details(err.to_string())
    }
}
