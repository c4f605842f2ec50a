//! Core data models shared by the indexing pipeline and the query engine.
//!
//! These types represent the documents, chunks, fingerprints and folder
//! status values that flow between the orchestrator, the stores and
//! observers of the status stream.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ErrorKind;

/// Size, modification time and content hash of a file.
///
/// Two fingerprints with equal hashes describe the same content; equal
/// size and mtime are trusted as "unchanged" without re-hashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime_ms: i64,
    /// Hex-encoded SHA-256 of the file bytes.
    pub content_hash: String,
}

impl Fingerprint {
    pub fn same_stat(&self, size: u64, mtime_ms: i64) -> bool {
        self.size == size && self.mtime_ms == mtime_ms
    }
}

/// A file inside a folder, as recorded in the vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// Path relative to the folder root, `/`-separated.
    pub path: String,
    pub fingerprint: Fingerprint,
    pub indexed: bool,
    pub modified_at: i64,
    pub chunk_count: i64,
}

/// A contiguous slice of a document's extracted text.
///
/// Offsets are character (not byte) positions into the extracted text;
/// `end` is exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub start: i64,
    pub end: i64,
    pub text: String,
    pub hash: String,
    pub key_phrases: Vec<String>,
    pub readability: f32,
}

/// A document that could not be indexed during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDocument {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Progress counters for a folder. Kept across errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderProgress {
    pub files_total: u64,
    pub files_scanned: u64,
    pub files_indexed: u64,
    pub files_failed: u64,
    pub bytes_total: u64,
    pub bytes_indexed: u64,
    pub percent: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedDocument>,
}

impl FolderProgress {
    pub fn recompute_percent(&mut self) {
        self.percent = if self.files_total == 0 {
            100.0
        } else {
            let done = (self.files_indexed + self.files_failed).min(self.files_total);
            (done as f32 / self.files_total as f32) * 100.0
        };
    }
}

/// Human-readable error attached to a folder snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Whether `retry_folder` can resume this folder.
    pub retryable: bool,
}

/// Point-in-time status of one folder, as published on the status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderSnapshot {
    pub path: PathBuf,
    pub model_id: String,
    /// One of `pending`, `scanning`, `downloading_model`, `indexing`,
    /// `active`, `error`, `removed`.
    pub state: String,
    pub progress: FolderProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FolderErrorInfo>,
}

/// Row counts for one folder's private storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RowCounts {
    pub documents: i64,
    pub chunks: i64,
    pub chunk_vectors: i64,
    pub document_vectors: i64,
    pub fingerprints: i64,
}

impl RowCounts {
    pub fn is_empty(&self) -> bool {
        self.documents == 0
            && self.chunks == 0
            && self.chunk_vectors == 0
            && self.document_vectors == 0
            && self.fingerprints == 0
    }
}
