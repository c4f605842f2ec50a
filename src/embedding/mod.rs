//! Embedding backends and vector utilities.
//!
//! Defines the [`EmbeddingBackend`] trait and its implementations:
//! - **`LocalBackend`** ([`local`]) runs ONNX models in-process on the CPU via fastembed.
//! - **[`WorkerBackend`](worker::WorkerBackend)** drives a persistent external process
//!   that serves accelerator-backed models over a JSON-lines protocol.
//!
//! [`EmbeddingPool`](pool::EmbeddingPool) owns one backend per model and is the
//! only entry point used by the orchestrator and the query engine.
//!
//! Also provides vector utilities for the vector store:
//! - [`cosine_similarity`] compute similarity between two embedding vectors
//! - [`vec_to_blob`] encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`] decode a SQLite BLOB back into a `Vec<f32>`

#[cfg(feature = "local-embeddings-fastembed")]
pub mod local;
pub mod pool;
pub mod worker;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::IndexError;
use crate::model_registry::BackendKind;

pub use pool::{BackendFactory, DefaultBackendFactory, EmbeddingPool};

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The backend process died or its channel broke mid-request.
    #[error("embedding worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("embedding backend error: {0}")]
    Backend(String),

    #[error("embedding backend timed out after {0}s")]
    Timeout(u64),

    #[error("expected {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("expected {expected} vectors, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("no backend available for model {0}")]
    Unavailable(String),

    #[error("embedding cancelled")]
    Cancelled,
}

impl EmbedError {
    /// Failures that a fresh attempt may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbedError::WorkerCrashed(_) | EmbedError::Timeout(_) | EmbedError::Backend(_)
        )
    }

    /// Classify for a folder's status or a query's caller.
    pub fn into_index_error(self, model_id: &str) -> IndexError {
        match self {
            EmbedError::Cancelled => IndexError::Cancelled,
            EmbedError::Unavailable(message) => IndexError::ModelAcquisition {
                model_id: model_id.to_string(),
                message,
            },
            other => IndexError::io(format!("embedding with {}", model_id), other),
        }
    }
}

/// A loaded embedding model.
///
/// Implementations must return exactly one vector per input, in input
/// order, each of length [`dims`](Self::dims).
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn model_id(&self) -> &str;

    fn dims(&self) -> usize;

    fn kind(&self) -> BackendKind;

    /// Texts per call that balance throughput against memory.
    fn preferred_batch_size(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    async fn health_check(&self) -> Result<(), EmbedError> {
        Ok(())
    }

    /// Bring the backend back after a crash. In-process backends have
    /// nothing to restart.
    async fn restart(&self) -> Result<(), EmbedError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Check a backend response against the request before handing it on.
pub fn validate_batch(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dims: usize,
) -> Result<(), EmbedError> {
    if vectors.len() != expected_count {
        return Err(EmbedError::CountMismatch {
            expected: expected_count,
            actual: vectors.len(),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbedError::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use folder_index::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Scale `v` to unit length in place. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Normalised mean of `vectors`, used as a document-level embedding.
pub fn mean_vector(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut mean = vec![0.0f32; first.len()];
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    l2_normalize(&mut mean);
    Some(mean)
}
