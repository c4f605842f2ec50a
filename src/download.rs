//! Atomic, resumable artifact downloads.
//!
//! An artifact is streamed into `<name>.part`, resuming from the existing
//! part file when the server honours `Range`. Once complete the bytes are
//! hashed and checked against the expected size and SHA-256, then renamed
//! into the content-addressed blob store. A checksum failure deletes the
//! part file so the next attempt starts clean. A part file that already
//! holds the whole artifact (the process stopped between the last write
//! and the rename) is verified and stored without another request.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::cancel::CancelToken;
use crate::fingerprint;
use crate::model_registry::ModelArtifact;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP {status} fetching {url}")]
    Http { url: String, status: u16 },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("model cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Http { status, .. } => *status == 429 || *status >= 500,
            DownloadError::Network { .. }
            | DownloadError::ChecksumMismatch { .. }
            | DownloadError::SizeMismatch { .. } => true,
            DownloadError::Io(_) | DownloadError::Cancelled => false,
        }
    }
}

/// A body being streamed from a fetcher.
#[async_trait]
pub trait ByteStream: Send {
    /// Next chunk of bytes, or `None` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadError>;
}

pub struct FetchResponse {
    /// True when the body starts at the requested offset rather than byte 0.
    pub resumed: bool,
    /// Full artifact length, when the server reported it.
    pub total: Option<u64>,
    pub body: Box<dyn ByteStream>,
}

/// Source of artifact bytes. The HTTP implementation is used in
/// production; tests use [`MemoryFetcher`].
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn open(&self, url: &str, offset: u64) -> Result<FetchResponse, DownloadError>;
}

// ============ HTTP ============

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("fidx/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::Network {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

struct HttpBody {
    url: String,
    response: reqwest::Response,
}

#[async_trait]
impl ByteStream for HttpBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadError> {
        self.response
            .chunk()
            .await
            .map(|c| c.map(|b| b.to_vec()))
            .map_err(|e| DownloadError::Network {
                url: self.url.clone(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn open(&self, url: &str, offset: u64) -> Result<FetchResponse, DownloadError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(|e| DownloadError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let resumed = status.as_u16() == 206;
        let total = response
            .content_length()
            .map(|len| if resumed { len + offset } else { len });

        Ok(FetchResponse {
            resumed,
            total,
            body: Box::new(HttpBody {
                url: url.to_string(),
                response,
            }),
        })
    }
}

// ============ In-memory ============

/// Serves artifacts from memory. Supports `Range` resumption and
/// injecting corrupted responses.
#[derive(Default)]
pub struct MemoryFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
    corrupt: Mutex<HashMap<String, usize>>,
    truncate: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<(String, u64)>>,
    chunk_size: usize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self {
            chunk_size: 1024,
            ..Default::default()
        }
    }

    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(url.into(), bytes);
        }
    }

    /// Serve flipped bytes for the next `times` requests of `url`.
    pub fn corrupt_next(&self, url: impl Into<String>, times: usize) {
        if let Ok(mut corrupt) = self.corrupt.lock() {
            corrupt.insert(url.into(), times);
        }
    }

    /// End the next body of `url` after `len` bytes while still reporting
    /// the full length, as a dropped connection would.
    pub fn truncate_next(&self, url: impl Into<String>, len: usize) {
        if let Ok(mut truncate) = self.truncate.lock() {
            truncate.insert(url.into(), len);
        }
    }

    /// `(url, offset)` of every request served so far.
    pub fn requests(&self) -> Vec<(String, u64)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

struct MemoryBody {
    chunks: std::vec::IntoIter<Vec<u8>>,
}

#[async_trait]
impl ByteStream for MemoryBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadError> {
        Ok(self.chunks.next())
    }
}

#[async_trait]
impl ArtifactFetcher for MemoryFetcher {
    async fn open(&self, url: &str, offset: u64) -> Result<FetchResponse, DownloadError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((url.to_string(), offset));
        }
        let mut bytes = self
            .files
            .lock()
            .ok()
            .and_then(|f| f.get(url).cloned())
            .ok_or_else(|| DownloadError::Http {
                url: url.to_string(),
                status: 404,
            })?;

        if let Ok(mut corrupt) = self.corrupt.lock() {
            if let Some(remaining) = corrupt.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    for b in bytes.iter_mut() {
                        *b = !*b;
                    }
                }
            }
        }

        let total = bytes.len() as u64;
        if offset > 0 && offset >= total {
            return Err(DownloadError::Http {
                url: url.to_string(),
                status: 416,
            });
        }
        let start = offset as usize;
        let mut end = bytes.len();
        if let Ok(mut truncate) = self.truncate.lock() {
            if let Some(len) = truncate.remove(url) {
                end = end.min(start + len);
            }
        }
        let chunks: Vec<Vec<u8>> = bytes[start..end]
            .chunks(self.chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        Ok(FetchResponse {
            resumed: offset > 0,
            total: Some(total),
            body: Box::new(MemoryBody {
                chunks: chunks.into_iter(),
            }),
        })
    }
}

// ============ Download ============

/// Location of a verified artifact in the blob store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub sha256: String,
    pub path: PathBuf,
}

/// Path of the blob holding content with the given hash.
pub fn blob_path(blobs_dir: &Path, sha256: &str) -> PathBuf {
    blobs_dir.join(format!("sha256-{}", sha256))
}

/// Download one artifact into `blobs_dir`, reporting the fraction of the
/// artifact received so far to `on_progress`.
pub async fn download_artifact(
    fetcher: &dyn ArtifactFetcher,
    artifact: &ModelArtifact,
    blobs_dir: &Path,
    part_path: &Path,
    cancel: &CancelToken,
    on_progress: &(dyn Fn(f32) + Send + Sync),
) -> Result<StoredBlob, DownloadError> {
    if let Some(expected) = &artifact.sha256 {
        let existing = blob_path(blobs_dir, expected);
        if tokio::fs::try_exists(&existing).await? {
            on_progress(1.0);
            return Ok(StoredBlob {
                sha256: expected.clone(),
                path: existing,
            });
        }
    }

    if let Some(parent) = part_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::create_dir_all(blobs_dir).await?;

    let mut offset = match tokio::fs::metadata(part_path).await {
        Ok(m) => m.len(),
        Err(_) => 0,
    };

    if offset > 0 && artifact.size.is_some_and(|size| offset >= size) {
        match store_part(artifact, blobs_dir, part_path, offset).await {
            Ok(blob) => {
                tracing::debug!(file = %artifact.file, "stored complete part file");
                on_progress(1.0);
                return Ok(blob);
            }
            Err(e) => {
                tracing::warn!(file = %artifact.file, error = %e, "discarding part file");
                offset = 0;
            }
        }
    }

    let opened = cancel
        .run(fetcher.open(&artifact.url, offset))
        .await
        .ok_or(DownloadError::Cancelled)?;
    let response = match opened {
        // Nothing past the offset: the part file already holds the body.
        Err(DownloadError::Http { status: 416, .. }) if offset > 0 => {
            tracing::debug!(file = %artifact.file, offset, "range not satisfiable, verifying part file");
            let blob = store_part(artifact, blobs_dir, part_path, offset).await?;
            on_progress(1.0);
            return Ok(blob);
        }
        other => other?,
    };

    let reported_total = response.total;
    let total = artifact.size.or(reported_total);
    let mut file = if response.resumed && offset > 0 {
        tracing::debug!(file = %artifact.file, offset, "resuming download");
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(part_path)
            .await?
    } else {
        tokio::fs::File::create(part_path).await?
    };
    let mut received = if response.resumed { offset } else { 0 };

    let mut body = response.body;
    loop {
        let chunk = cancel
            .run(body.next_chunk())
            .await
            .ok_or(DownloadError::Cancelled)??;
        let Some(chunk) = chunk else { break };
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        if let Some(total) = total.filter(|t| *t > 0) {
            on_progress((received as f32 / total as f32).min(1.0));
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = reported_total.filter(|_| artifact.size.is_none()) {
        if received != expected {
            let _ = tokio::fs::remove_file(part_path).await;
            return Err(DownloadError::SizeMismatch {
                file: artifact.file.clone(),
                expected,
                actual: received,
            });
        }
    }

    let blob = store_part(artifact, blobs_dir, part_path, received).await?;
    on_progress(1.0);
    Ok(blob)
}

/// Check a finished part file against the artifact's size and hash and
/// move it into the blob store. A part file that fails is deleted.
async fn store_part(
    artifact: &ModelArtifact,
    blobs_dir: &Path,
    part_path: &Path,
    received: u64,
) -> Result<StoredBlob, DownloadError> {
    if let Some(expected) = artifact.size {
        if received != expected {
            let _ = tokio::fs::remove_file(part_path).await;
            return Err(DownloadError::SizeMismatch {
                file: artifact.file.clone(),
                expected,
                actual: received,
            });
        }
    }

    let hash_path = part_path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || fingerprint::hash_file(&hash_path))
        .await
        .map_err(|e| DownloadError::Io(std::io::Error::other(e.to_string())))??;

    if let Some(expected) = &artifact.sha256 {
        if !expected.eq_ignore_ascii_case(&actual) {
            let _ = tokio::fs::remove_file(part_path).await;
            return Err(DownloadError::ChecksumMismatch {
                file: artifact.file.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    let dest = blob_path(blobs_dir, &actual);
    tokio::fs::rename(part_path, &dest).await?;
    Ok(StoredBlob {
        sha256: actual,
        path: dest,
    })
}
