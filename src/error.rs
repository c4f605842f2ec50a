//! Error taxonomy for the indexing engine.
//!
//! Every failure that reaches a folder's status is one of the [`ErrorKind`]s
//! below. Subsystems keep their own error enums (`EmbedError`,
//! `DownloadError`, `ExtractError`) and are classified into [`IndexError`]
//! at the orchestrator and manager boundaries.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification attached to folder status and surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad folder path, invalid query or unsupported model. Rejected synchronously.
    Validation,
    /// Filesystem hiccup or backend timeout. Retried with backoff.
    TransientIo,
    /// Model download or integrity failure. Resumable through a retry action.
    ModelAcquisition,
    /// A subset of documents failed extraction or embedding.
    PartialIndexFailure,
    /// Corruption or unrecoverable transaction failure. Requires removal and re-add.
    FatalStorage,
    /// The operation was cancelled by folder removal or shutdown.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::ModelAcquisition => "model_acquisition",
            ErrorKind::PartialIndexFailure => "partial_index_failure",
            ErrorKind::FatalStorage => "fatal_storage",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid folder {path}: {reason}")]
    InvalidFolder { path: PathBuf, reason: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("folder is not watched: {0}")]
    UnknownFolder(PathBuf),

    #[error("transient I/O failure ({context}): {message}")]
    TransientIo { context: String, message: String },

    #[error("could not acquire model {model_id}: {message}")]
    ModelAcquisition { model_id: String, message: String },

    #[error("{failed} of {attempted} documents failed to index")]
    PartialIndexFailure { failed: usize, attempted: usize },

    #[error("storage failure: {0}")]
    FatalStorage(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::InvalidFolder { .. }
            | IndexError::InvalidQuery(_)
            | IndexError::UnsupportedModel(_)
            | IndexError::UnknownFolder(_) => ErrorKind::Validation,
            IndexError::TransientIo { .. } => ErrorKind::TransientIo,
            IndexError::ModelAcquisition { .. } => ErrorKind::ModelAcquisition,
            IndexError::PartialIndexFailure { .. } => ErrorKind::PartialIndexFailure,
            IndexError::FatalStorage(_) => ErrorKind::FatalStorage,
            IndexError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn invalid_folder(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        IndexError::InvalidFolder {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        IndexError::TransientIo {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// True when the operation may succeed if simply attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientIo)
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                IndexError::io("storage", &err)
            }
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
                let busy = db
                    .code()
                    .and_then(|c| c.parse::<i64>().ok())
                    .map(|c| matches!(c & 0xff, 5 | 6))
                    .unwrap_or(false);
                if busy {
                    IndexError::io("storage", &err)
                } else {
                    IndexError::FatalStorage(err.to_string())
                }
            }
            _ => IndexError::FatalStorage(err.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, IndexError>;
