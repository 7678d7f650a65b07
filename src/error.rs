//! Error types for admission, relay, staging and launch.

use std::io;
use std::path::PathBuf;

use axum::{
    extract::rejection::JsonRejection,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Reasons an execution request is refused before any resource is allocated.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported language: {0}")]
    InvalidLanguage(String),

    #[error("Connection {0} already has a program running")]
    AlreadyRunning(String),

    #[error("Unknown connection: {0}")]
    UnknownSession(String),
}

impl SubmitError {
    /// Bad or missing request fields, or an unknown language.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingField(_) | Self::InvalidLanguage(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Room id must not be empty")]
    InvalidRoom,

    #[error("Unknown connection: {0}")]
    UnknownSession(String),
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Unable to create staging directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Unable to write source file {}: {source}", path.display())]
    WriteSource { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Unable to start sandbox runtime `{program}`: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("Sandbox runtime did not expose {0}")]
    MissingPipe(&'static str),
}

/// HTTP-facing error with a JSON `{error}` body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Too many requests, please try again later.")]
    TooManyRequests { retry_after_secs: u64 },
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        let message = err.to_string();
        if err.is_validation() {
            return Self::BadRequest(message);
        }
        match err {
            SubmitError::UnknownSession(_) => Self::NotFound(message),
            _ => Self::Conflict(message),
        }
    }
}

/// Bodies axum cannot read as a request (wrong content type, broken JSON, wrong field types)
/// are validation failures like any other.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(format!("Invalid request body: {}", rejection.body_text()))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorBody { error: self.to_string() });
        match self {
            Self::TooManyRequests { retry_after_secs } => {
                warn!(retry_after_secs, "Rate limit exceeded");
                (status, [(header::RETRY_AFTER, retry_after_secs.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
