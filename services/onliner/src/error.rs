//! Service-specific error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Façade request errors.
///
/// Each maps to a fixed status and JSON body. Validation errors are answered
/// here and never reach the pool.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing token")]
    MissingToken,

    #[error("Token is already in use")]
    TokenInUse,

    #[error("Token is not in use")]
    TokenNotInUse,

    #[error("You must provide an authorization header")]
    MissingAuthorization,

    #[error("You must provide a valid authorization header")]
    InvalidAuthorization,

    #[error("Storage unavailable")]
    Storage(#[from] session_pool::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingToken | ApiError::TokenInUse | ApiError::TokenNotInUse => {
                StatusCode::BAD_REQUEST
            }
            ApiError::MissingAuthorization | ApiError::InvalidAuthorization => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            ApiError::MissingAuthorization | ApiError::InvalidAuthorization => {
                serde_json::json!({ "error": "Unauthorized", "message": self.to_string() })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Storage(ref e) = self {
            tracing::error!(error = %e, "credential store failed during request");
        }
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            self.body().to_string(),
        )
            .into_response()
    }
}
