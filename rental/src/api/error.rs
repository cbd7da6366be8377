//! HTTP error type.
//!
//! Bridges [`RentalError`] to HTTP responses by error kind.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rentflow_core::error::{ErrorKind, RentalError};
use serde::Serialize;
use std::fmt;

/// Application error returned by handlers.
///
/// Renders as `{"code": ..., "message": ...}` with the matching status.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: &'static str,
}

impl AppError {
    /// Create an error with an explicit status and code.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>, code: &'static str) -> Self {
        Self {
            status,
            message: message.into(),
            code,
        }
    }

    /// 404
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND",
        )
    }

    /// 409
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message, "CONFLICT")
    }

    /// 422
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message, "VALIDATION_ERROR")
    }

    /// 503: retry later.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            message,
            "SERVICE_UNAVAILABLE",
        )
    }

    /// HTTP status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl From<RentalError> for AppError {
    fn from(error: RentalError) -> Self {
        match (error.kind(), error) {
            (_, RentalError::NotFound { entity, id }) => Self::not_found(entity, id),
            (ErrorKind::Validation, error) => Self::validation(error.to_string()),
            (ErrorKind::Conflict, error) => Self::conflict(error.to_string()),
            (_, error) => Self::unavailable(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                code = self.code,
                message = %self.message,
                "Request failed"
            );
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };

        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_statuses() {
        let cases = [
            (RentalError::Validation("bad window".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (RentalError::Conflict("overlap".into()), StatusCode::CONFLICT),
            (RentalError::not_found("reservation", 7), StatusCode::NOT_FOUND),
            (RentalError::Transient("pool timed out".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, status) in cases {
            assert_eq!(AppError::from(error).status(), status);
        }
    }

    #[test]
    fn not_found_names_the_resource() {
        let err = AppError::from(RentalError::not_found("reservation", 7));
        assert_eq!(err.to_string(), "[NOT_FOUND] reservation with id 7 not found");
    }
}
