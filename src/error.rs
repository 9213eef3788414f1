use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for ctxheap operations
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Segment {0} is pinned; unpin it first")]
    PinnedSegment(String),

    #[error("Destructive operation requires confirm=true")]
    ConfirmationRequired,

    #[error("Storage failure at {}: {source}", path.display())]
    StorageFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Index inconsistency: {0}")]
    IndexInconsistency(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias for ctxheap operations
pub type Result<T> = std::result::Result<T, ContextError>;

/// Coarse classification carried in per-item batch errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameter,
    NotFound,
    PinnedSegment,
    ConfirmationRequired,
    StorageFailure,
    IndexInconsistency,
    Internal,
}

impl ContextError {
    pub fn segment_not_found(id: impl Into<String>) -> Self {
        ContextError::NotFound {
            kind: "Segment",
            id: id.into(),
        }
    }

    pub fn project_not_found(id: impl Into<String>) -> Self {
        ContextError::NotFound {
            kind: "Project",
            id: id.into(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ContextError::StorageFailure {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            ContextError::NotFound { .. } => ErrorKind::NotFound,
            ContextError::PinnedSegment(_) => ErrorKind::PinnedSegment,
            ContextError::ConfirmationRequired => ErrorKind::ConfirmationRequired,
            ContextError::StorageFailure { .. } | ContextError::Io(_) => ErrorKind::StorageFailure,
            ContextError::IndexInconsistency(_) => ErrorKind::IndexInconsistency,
            ContextError::Serialization(_) | ContextError::Json(_) | ContextError::Metrics(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this error indicates a transient failure that could be retried
    pub fn is_retriable(&self) -> bool {
        matches!(self, ContextError::StorageFailure { .. } | ContextError::Io(_))
    }

    /// Errors the caller can fix locally (unpin, rebuild) without losing data
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ContextError::PinnedSegment(_)
                | ContextError::IndexInconsistency(_)
                | ContextError::ConfirmationRequired
        )
    }
}
