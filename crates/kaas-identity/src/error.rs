//! HTTP-facing error type for the identity endpoints

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors returned by the identity endpoints
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Token issuance refused
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown workspace
    #[error("not found: {0}")]
    NotFound(String),

    /// Server failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            IdentityError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "access_denied"),
            IdentityError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            IdentityError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };
        let body = serde_json::json!({
            "error": code,
            "error_description": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

impl From<kaas_common::Error> for IdentityError {
    fn from(e: kaas_common::Error) -> Self {
        match e {
            kaas_common::Error::Authentication { .. } => IdentityError::Unauthorized(e.to_string()),
            kaas_common::Error::NotFound { .. } => IdentityError::NotFound(e.to_string()),
            other => IdentityError::Internal(other.to_string()),
        }
    }
}

impl From<kaas_store::StoreError> for IdentityError {
    fn from(e: kaas_store::StoreError) -> Self {
        IdentityError::from(kaas_common::Error::from(e))
    }
}

impl From<std::io::Error> for IdentityError {
    fn from(e: std::io::Error) -> Self {
        IdentityError::Internal(e.to_string())
    }
}
