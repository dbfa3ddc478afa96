use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

/// Convenience type alias for Results with [`MessError`].
pub type Result<T> = std::result::Result<T, MessError>;

/// Error taxonomy for the mess server.
///
/// Variants map onto the error classes a conforming implementation must
/// distinguish: request-rejection classes the client can act on
/// (`Validation`, `AuthZ`, `NotFound`, `MethodNotAllowed`, `TransientBot`)
/// versus classes that indicate the server itself is broken and should not
/// keep serving (`Conflict`, `Storage`).
#[derive(Error, Debug)]
pub enum MessError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    AuthZ,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("bot transiently unavailable: {0}")]
    TransientBot(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MessError {
    /// `Conflict` and `Storage` are treated as unrecoverable: a handler that
    /// hits one should log at `error!` and let the caller decide whether to
    /// fail the whole process, not just the request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MessError::Conflict(_) | MessError::Storage(_))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    details: Option<String>,
}

impl IntoResponse for MessError {
    fn into_response(self) -> Response {
        let status = match &self {
            MessError::Validation(_) => StatusCode::BAD_REQUEST,
            MessError::AuthZ => StatusCode::FORBIDDEN,
            MessError::NotFound(_) => StatusCode::NOT_FOUND,
            MessError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            MessError::Conflict(_) => StatusCode::CONFLICT,
            MessError::Storage(_) | MessError::Sqlite(_) | MessError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            MessError::TransientBot(_) => StatusCode::SERVICE_UNAVAILABLE,
            MessError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MessError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MessError::Serialization(_) => StatusCode::BAD_REQUEST,
        };

        if self.is_fatal() {
            tracing::error!(error = %self, "fatal error handling request");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }

        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("error").to_string(),
            details: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}
