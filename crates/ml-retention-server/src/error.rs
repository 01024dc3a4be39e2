//! Error types for the retention server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ml_retention::CacheError;
use serde_json::json;
use std::fmt;

/// Errors that stop a command
#[derive(Debug)]
pub enum ServerError {
    Cache(CacheError),
    Database(Box<sqlx::Error>),
    Config(String),
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Cache(err) => write!(f, "{}", err),
            ServerError::Database(err) => write!(f, "Database error: {}", err),
            ServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ServerError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Cache(err) => Some(err),
            ServerError::Database(err) => Some(err.as_ref()),
            ServerError::Io(err) => Some(err),
            ServerError::Config(_) => None,
        }
    }
}

impl From<CacheError> for ServerError {
    fn from(err: CacheError) -> Self {
        ServerError::Cache(err)
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        ServerError::Database(Box::new(err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for ServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ServerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Handler error that converts to a JSON response
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    /// A policy run failed; the reason is safe to show operators
    ExecutionFailed(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unavailable(msg) => {
                tracing::warn!(error = %msg, "Storage unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            AppError::ExecutionFailed(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        let message = err.to_string();
        match err {
            CacheError::InvalidFeature(_) | CacheError::InvalidPolicy(_) => {
                AppError::BadRequest(message)
            }
            CacheError::NotFound(_) => AppError::NotFound(message),
            CacheError::PolicyBusy(_) => AppError::Conflict(message),
            CacheError::StorageUnavailable(_) | CacheError::CascadeDeleteFailed { .. } => {
                AppError::Unavailable(message)
            }
            CacheError::PolicyExecutionFailed { .. } => AppError::ExecutionFailed(message),
            CacheError::Database(_) | CacheError::Serialization(_) => AppError::Internal(message),
        }
    }
}
