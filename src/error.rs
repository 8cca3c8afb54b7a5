//! Structured errors shared across the control plane

use serde::Serialize;
use thiserror::Error;

/// Error classification for every recoverable failure in the system.
///
/// The kind determines how callers react: `QueueFull` may be retried,
/// `InvalidArgument` never changed any state, build kinds end up on the
/// build record, deployment kinds on the deployment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input: malformed slug, replica count out of range, unknown source kind
    InvalidArgument,
    /// Unknown app or build id
    NotFound,
    /// Slug collision on app creation
    Conflict,
    /// Build queue is at capacity
    QueueFull,
    /// No Dockerfile found and no known project descriptor to synthesize one
    DockerfileMissing,
    /// Clone or extraction failed, including path-traversal rejection
    SourceFetchFailed,
    /// Image build failed or exceeded its deadline
    BuildFailed,
    /// Container runtime operation failed during deploy/scale
    RuntimeError,
    /// Deployment failed and the rollback attempt failed too
    RollbackFailed,
    /// Operation deadline exceeded
    Timeout,
    /// Build was explicitly cancelled
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::DockerfileMissing => "dockerfile_missing",
            ErrorKind::SourceFetchFailed => "source_fetch_failed",
            ErrorKind::BuildFailed => "build_failed",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::RollbackFailed => "rollback_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried through every fallible operation.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct PaasError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PaasError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, message)
    }

    pub fn dockerfile_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DockerfileMissing, message)
    }

    pub fn source_fetch_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SourceFetchFailed, message)
    }

    pub fn build_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BuildFailed, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeError, message)
    }

    pub fn rollback_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RollbackFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// JSON form handed to API consumers.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"kind":"{}","message":"{}"}}"#,
                self.kind.as_str(),
                self.message.replace('"', "\\\"")
            )
        })
    }
}

pub type Result<T> = std::result::Result<T, PaasError>;
