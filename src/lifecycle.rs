//! Folder lifecycle state machine.
//!
//! A folder's state is a plain tagged value; [`transition`] is a pure
//! function from (state, event) to the next state. The manager owns one
//! state value per folder and is the only caller.
//!
//! ```text
//! pending ─► scanning ─┬─► downloading_model ─► indexing ─► active
//!                      └──────────────────────► indexing     │  ▲
//!                                                  ▲         │  │
//!                                                  └─────────┘  │
//!                                                 change event  │
//! any ─► error (retry ─► scanning)         any ─► removed (terminal)
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FolderState {
    Pending,
    Scanning,
    DownloadingModel { percent: f32 },
    Indexing,
    Active,
    Error { kind: ErrorKind, message: String },
    Removed,
}

impl FolderState {
    pub fn name(&self) -> &'static str {
        match self {
            FolderState::Pending => "pending",
            FolderState::Scanning => "scanning",
            FolderState::DownloadingModel { .. } => "downloading_model",
            FolderState::Indexing => "indexing",
            FolderState::Active => "active",
            FolderState::Error { .. } => "error",
            FolderState::Removed => "removed",
        }
    }

    /// Whether the folder is waiting for an event rather than working.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            FolderState::Active | FolderState::Error { .. } | FolderState::Removed
        )
    }

    /// Error states that [`FolderEvent::Retry`] can leave.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FolderState::Error { kind, .. } if *kind != ErrorKind::FatalStorage)
    }
}

impl std::fmt::Display for FolderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FolderEvent {
    /// The folder passed validation and its worker started.
    Started,
    /// The folder was enumerated; `model_ready` tells whether its model
    /// is already in the cache.
    Scanned { model_ready: bool },
    DownloadProgress { percent: f32 },
    DownloadCompleted,
    IndexCompleted,
    /// A filesystem change or restart asks for an incremental pass.
    ChangeDetected,
    Failed { kind: ErrorKind, message: String },
    Retry,
    /// The folder's model was replaced and its index discarded.
    ModelChanged,
    Removed,
}

impl FolderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FolderEvent::Started => "started",
            FolderEvent::Scanned { .. } => "scanned",
            FolderEvent::DownloadProgress { .. } => "download_progress",
            FolderEvent::DownloadCompleted => "download_completed",
            FolderEvent::IndexCompleted => "index_completed",
            FolderEvent::ChangeDetected => "change_detected",
            FolderEvent::Failed { .. } => "failed",
            FolderEvent::Retry => "retry",
            FolderEvent::ModelChanged => "model_changed",
            FolderEvent::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no transition from {from} on {event}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: &'static str,
}

pub fn transition(
    state: &FolderState,
    event: &FolderEvent,
) -> Result<FolderState, InvalidTransition> {
    use FolderEvent as E;
    use FolderState as S;

    let next = match (state, event) {
        (S::Removed, _) => None,
        (_, E::Removed) => Some(S::Removed),
        (
            _,
            E::Failed {
                kind: ErrorKind::Cancelled,
                ..
            },
        ) => None,
        (_, E::Failed { kind, message }) => Some(S::Error {
            kind: *kind,
            message: message.clone(),
        }),
        (_, E::ModelChanged) => Some(S::Scanning),

        (S::Pending, E::Started) => Some(S::Scanning),
        (S::Scanning, E::Scanned { model_ready: true }) => Some(S::Indexing),
        (S::Scanning, E::Scanned { model_ready: false }) => {
            Some(S::DownloadingModel { percent: 0.0 })
        }
        // Progress only moves forward.
        (S::DownloadingModel { percent: current }, E::DownloadProgress { percent }) => {
            Some(S::DownloadingModel {
                percent: current.max(percent.clamp(0.0, 100.0)),
            })
        }
        (S::DownloadingModel { .. }, E::DownloadCompleted) => Some(S::Indexing),
        (S::Indexing, E::IndexCompleted) => Some(S::Active),
        (S::Active, E::ChangeDetected) => Some(S::Indexing),
        (S::Error { kind, .. }, E::Retry) if *kind != ErrorKind::FatalStorage => Some(S::Scanning),
        _ => None,
    };

    next.ok_or(InvalidTransition {
        from: state.name(),
        event: event.name(),
    })
}
