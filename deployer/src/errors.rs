//! Error types for the deployer

use http::StatusCode;
use thiserror::Error;

use crate::models::deployment::{DeploymentRecord, DeploymentStatus, FailurePoint};

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Repository mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Unsupported event: {0}")]
    UnsupportedEvent(String),

    #[error("No deployment matches {0}")]
    MissingCorrelation(String),

    #[error("Deployment {} is already {}", .0.id, .0.status)]
    Conflict(Box<DeploymentRecord>),

    #[error("Invalid transition: {from} cannot handle {event}")]
    InvalidTransition {
        from: DeploymentStatus,
        event: String,
    },

    #[error("Deployment {id} changed concurrently: expected {expected}, found {actual}")]
    StaleRecord {
        id: String,
        expected: DeploymentStatus,
        actual: DeploymentStatus,
    },

    #[error("Deployment lock for site {site} is held by {holder}")]
    LockHeld { site: String, holder: String },

    #[error("Remote trigger failed: {0}")]
    RemoteTrigger(String),

    #[error("Remote build failed: {0}")]
    RemoteBuildFailure(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact download failed: {0}")]
    ArtifactDownload(String),

    #[error("Cannot open archive: {0}")]
    ArchiveOpen(String),

    #[error("Cannot extract archive: {0}")]
    ArchiveExtract(String),

    #[error("Copy failed: {0}")]
    CopyError(String),

    #[error("Backup error: {0}")]
    BackupError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Pipeline stage a processing error is attributed to
    pub fn failure_point(&self) -> FailurePoint {
        match self {
            DeployError::RemoteTrigger(_) => FailurePoint::Trigger,
            DeployError::RemoteBuildFailure(_) => FailurePoint::RemoteBuild,
            DeployError::LockHeld { .. } => FailurePoint::LockContention,
            DeployError::ArtifactNotFound(_) => FailurePoint::ArtifactResolve,
            DeployError::ArtifactDownload(_) | DeployError::HttpError(_) => FailurePoint::Download,
            DeployError::BackupError(_) => FailurePoint::Backup,
            DeployError::ArchiveOpen(_) => FailurePoint::ArchiveOpen,
            DeployError::ArchiveExtract(_) => FailurePoint::Extract,
            DeployError::CopyError(_) => FailurePoint::Copy,
            _ => FailurePoint::Internal,
        }
    }

    /// Whether retrying the same work later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeployError::IoError(_)
                | DeployError::HttpError(_)
                | DeployError::StaleRecord { .. }
                | DeployError::RemoteTrigger(_)
                | DeployError::ArtifactDownload(_)
                | DeployError::StorageError(_)
                | DeployError::Internal(_)
        )
    }

    /// HTTP status used when the error reaches the API surface
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeployError::AuthError(_) => StatusCode::UNAUTHORIZED,
            DeployError::IdentityMismatch { .. } => StatusCode::FORBIDDEN,
            DeployError::MalformedEvent(_) | DeployError::UnsupportedEvent(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployError::MissingCorrelation(_) | DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::Conflict(_)
            | DeployError::InvalidTransition { .. }
            | DeployError::StaleRecord { .. }
            | DeployError::LockHeld { .. } => StatusCode::CONFLICT,
            DeployError::RemoteTrigger(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<zip::result::ZipError> for DeployError {
    fn from(err: zip::result::ZipError) -> Self {
        DeployError::ArchiveExtract(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DeployError {
    fn from(err: tokio::task::JoinError) -> Self {
        DeployError::Internal(format!("blocking task failed: {err}"))
    }
}
