use crate::services::local::fleet_store::FleetError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failure taxonomy shared by every controller component.
///
/// Bucket- and manifest-scoped variants are recovered locally (skip, record,
/// retry); the rest propagate to the invocation's caller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("permission denied on bucket `{bucket}`: {message}")]
    Permission { bucket: String, message: String },
    #[error("transient service error: {0}")]
    Transient(String),
    #[error("manifest `{manifest}` already dispatched by another invocation")]
    DuplicateSubmission { manifest: String },
    #[error("malformed manifest `{location}`: {reason}")]
    ManifestFormat { location: String, reason: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invocation exceeded its {0:?} budget")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

impl ControllerError {
    pub fn manifest_format(location: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::ManifestFormat {
            location: location.to_string(),
            reason: reason.into(),
        }
    }

    /// Worth retrying with backoff.
    ///
    /// SQLite busy/locked conditions surface as database errors and are
    /// treated the same way as service throttling.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Sqlx(sqlx::Error::PoolTimedOut) => true,
            Self::Sqlx(sqlx::Error::Database(db_err)) => {
                let msg = db_err.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        }
    }

    /// Scoped to a single bucket or manifest; recorded and acknowledged to the
    /// transport instead of failing the invocation.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::Permission { .. } | Self::ManifestFormat { .. } | Self::NotFound(_)
        )
    }

    /// Short machine-readable label used in logs and pass reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Permission { .. } => "permission",
            Self::Transient(_) => "transient",
            Self::DuplicateSubmission { .. } => "duplicate_submission",
            Self::ManifestFormat { .. } => "manifest_format",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Timeout(_) => "timeout",
            Self::Sqlx(_) => "database",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ControllerError> for AppError {
    fn from(err: ControllerError) -> Self {
        let status = match &err {
            ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
            ControllerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ControllerError::Permission { .. } => StatusCode::FORBIDDEN,
            ControllerError::ManifestFormat { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ControllerError::DuplicateSubmission { .. } => StatusCode::CONFLICT,
            ControllerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            err if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<FleetError> for AppError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::BucketAlreadyExists(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            other => ControllerError::from(other).into(),
        }
    }
}
