//! Management API error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// JSON error body returned by the management API.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

/// Errors a management handler can surface.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Requested subdomain failed validation
    #[error(
        "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters."
    )]
    InvalidSubdomain,

    /// Tunnel creation failed
    #[error(transparent)]
    Tunnel(#[from] burrow_core::Error),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidSubdomain => StatusCode::FORBIDDEN,
            ApiError::Tunnel(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::InvalidSubdomain.status_code(),
            StatusCode::FORBIDDEN
        );
        let err = ApiError::Tunnel(burrow_core::Error::AlreadyStarted {
            id: "abcd".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
