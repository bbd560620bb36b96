//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use nestlog_engine::wire::{ConflictBody, ErrorBody, RemoteActivity};

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid activity: {0}")]
    Engine(#[from] nestlog_engine::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The stored version is newer than the client's token
    #[error("Version conflict: stored version is {}", .0.version)]
    Conflict(Box<RemoteActivity>),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match self {
            AppError::Engine(e) => {
                tracing::warn!("Rejected activity: {}", e);
                (
                    StatusCode::BAD_REQUEST,
                    "Invalid activity".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Conflict(current) => {
                let body = Json(ConflictBody {
                    error: "Version conflict".to_string(),
                    current: *current,
                });
                return (StatusCode::CONFLICT, body).into_response();
            }
        };

        let body = Json(ErrorBody {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
