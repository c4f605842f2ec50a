//! Incremental indexing orchestrator.
//!
//! One run walks a folder, diffs it against the fingerprint store, and
//! brings the vector store up to date:
//!
//! 1. scan files honoring include/exclude rules
//! 2. classify each file: unchanged (size + mtime match), touched (hash
//!    matches, only the fingerprint is refreshed) or changed
//! 3. extract and chunk changed files with bounded parallelism
//! 4. delete documents whose files disappeared
//! 5. embed pending chunks in batches, retrying with backoff
//! 6. replace each document's chunks and vectors in one transaction
//! 7. record the new fingerprint only after that write commits
//!
//! A file whose fingerprint was never written is simply picked up again on
//! the next run, so an interrupted run loses no work that was committed.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::{mean_vector, EmbedError, EmbeddingPool};
use crate::error::{ErrorKind, IndexError, Result};
use crate::extract::{DocumentReader, ExtractError};
use crate::fingerprint;
use crate::models::{Chunk, Document, FailedDocument, Fingerprint, FolderProgress};
use crate::scan::{scan_folder, ScanRules, ScannedFile};
use crate::store::FolderStorage;

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub scanned: usize,
    pub unchanged: usize,
    /// Files whose mtime changed but whose content did not.
    pub touched: usize,
    pub indexed: usize,
    pub removed: usize,
    /// Entries the scan could not read; their indexed rows were kept.
    pub unreadable: usize,
    pub chunks_written: usize,
    pub failed: Vec<FailedDocument>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Callback receiving progress after every file-level step.
pub type ProgressFn<'a> = dyn Fn(&FolderProgress) + Send + Sync + 'a;

/// What a hashing/extraction task found for one file.
enum Prepared {
    Touched {
        rel_path: String,
        fingerprint: Fingerprint,
    },
    Changed {
        rel_path: String,
        fingerprint: Fingerprint,
        text: String,
    },
    Vanished {
        rel_path: String,
    },
    Failed(FailedDocument),
}

/// A changed document waiting for its chunk vectors.
struct PendingDocument {
    document: Document,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
    failed: bool,
}

pub struct Orchestrator {
    config: Arc<Config>,
    pool: Arc<EmbeddingPool>,
    reader: Arc<dyn DocumentReader>,
    rules: ScanRules,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        pool: Arc<EmbeddingPool>,
        reader: Arc<dyn DocumentReader>,
    ) -> Result<Self> {
        let rules = ScanRules::from_config(&config.indexing)?;
        Ok(Self {
            config,
            pool,
            reader,
            rules,
        })
    }

    pub fn rules(&self) -> &ScanRules {
        &self.rules
    }

    pub fn pool(&self) -> &Arc<EmbeddingPool> {
        &self.pool
    }

    /// Run one incremental pass over `root` using `model_id`.
    ///
    /// Per-document failures are collected in the report. Only storage
    /// failures, a missing folder and cancellation end the run early.
    pub async fn run(
        &self,
        root: &Path,
        storage: &FolderStorage,
        model_id: &str,
        cancel: &CancelToken,
        on_progress: &ProgressFn<'_>,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let dims = self.pool.registry().get(model_id)?.dims;
        self.prepare_storage(storage, model_id, dims).await?;

        let mut report = RunReport::default();
        let mut progress = FolderProgress::default();

        // 1. Scan
        let scan = {
            let root = root.to_path_buf();
            let rules = self.rules.clone();
            tokio::task::spawn_blocking(move || scan_folder(&root, &rules))
                .await
                .map_err(|e| IndexError::io("scan", e))??
        };
        check_cancel(cancel)?;
        let files = &scan.files;
        report.unreadable = scan.unreadable.len();

        report.scanned = files.len();
        progress.files_total = files.len() as u64;
        progress.bytes_total = files.iter().map(|f| f.size).sum();
        progress.recompute_percent();
        on_progress(&progress);

        // 2. Classify against stored fingerprints
        let stored = storage.fingerprints.load_all().await?;
        let mut candidates: Vec<(ScannedFile, Option<String>)> = Vec::new();
        for file in files {
            match stored.get(&file.rel_path) {
                Some(fp) if fp.same_stat(file.size, file.mtime_ms) => {
                    report.unchanged += 1;
                    progress.files_scanned += 1;
                    progress.files_indexed += 1;
                    progress.bytes_indexed += file.size;
                }
                other => {
                    candidates.push((file.clone(), other.map(|fp| fp.content_hash.clone())));
                }
            }
        }
        progress.recompute_percent();
        on_progress(&progress);

        // 3. Hash and extract new or changed files
        let prepared = self.prepare_files(root, candidates, cancel).await?;

        let mut pending: Vec<PendingDocument> = Vec::new();
        for item in prepared {
            progress.files_scanned += 1;
            match item {
                Prepared::Touched {
                    rel_path,
                    fingerprint,
                } => {
                    storage.fingerprints.upsert(&rel_path, &fingerprint).await?;
                    report.touched += 1;
                    progress.files_indexed += 1;
                    progress.bytes_indexed += fingerprint.size;
                }
                Prepared::Changed {
                    rel_path,
                    fingerprint,
                    text,
                } => {
                    let id = storage.vectors.mark_pending(&rel_path, &fingerprint).await?;
                    let chunks = chunk_text(&id, &text, &self.config.chunking);
                    pending.push(PendingDocument {
                        document: Document {
                            id,
                            path: rel_path,
                            modified_at: fingerprint.mtime_ms,
                            fingerprint,
                            indexed: false,
                            chunk_count: chunks.len() as i64,
                        },
                        chunks,
                        vectors: Vec::new(),
                        failed: false,
                    });
                }
                Prepared::Vanished { rel_path } => {
                    tracing::debug!(path = %rel_path, "file vanished during scan");
                    progress.files_total = progress.files_total.saturating_sub(1);
                }
                Prepared::Failed(failed) => {
                    tracing::warn!(path = %failed.path, error = %failed.message, "document skipped");
                    progress.files_failed += 1;
                    report.failed.push(failed);
                }
            }
            progress.recompute_percent();
            on_progress(&progress);
        }
        check_cancel(cancel)?;

        // 4. Remove documents whose files are gone
        let present: BTreeSet<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        let mut known: BTreeSet<String> = stored.keys().cloned().collect();
        known.extend(
            storage
                .vectors
                .list_documents()
                .await?
                .into_iter()
                .map(|d| d.path),
        );
        for path in known
            .iter()
            .filter(|p| !present.contains(p.as_str()) && !scan.is_unreadable(p))
        {
            storage.vectors.delete_document(path).await?;
            storage.fingerprints.remove(path).await?;
            report.removed += 1;
            tracing::debug!(path = %path, "removed deleted document");
        }

        // 5-7. Embed and commit
        self.embed_and_commit(
            storage,
            model_id,
            dims,
            &mut pending,
            &mut report,
            &mut progress,
            cancel,
            on_progress,
        )
        .await?;

        progress.failed = report.failed.clone();
        progress.recompute_percent();
        on_progress(&progress);

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            folder = %root.display(),
            model = %model_id,
            scanned = report.scanned,
            unchanged = report.unchanged,
            touched = report.touched,
            indexed = report.indexed,
            removed = report.removed,
            unreadable = report.unreadable,
            failed = report.failed.len(),
            chunks = report.chunks_written,
            duration_ms = report.duration_ms,
            "index run complete"
        );
        Ok(report)
    }

    /// Make sure the store holds vectors for `model_id` only. A store built
    /// for another model is wiped, and its fingerprints with it.
    async fn prepare_storage(
        &self,
        storage: &FolderStorage,
        model_id: &str,
        dims: usize,
    ) -> Result<()> {
        let stored_model = storage.vectors.model_id().await?;
        let stored_dims = storage.vectors.dims().await?;
        let mismatch = matches!(&stored_model, Some(m) if m != model_id)
            || matches!(stored_dims, Some(d) if d != dims);
        if mismatch {
            tracing::info!(
                from = ?stored_model,
                to = %model_id,
                "index built with another model, rebuilding"
            );
            storage.purge().await?;
        }
        storage.vectors.ensure_dimension(dims, model_id).await
    }

    async fn prepare_files(
        &self,
        root: &Path,
        candidates: Vec<(ScannedFile, Option<String>)>,
        cancel: &CancelToken,
    ) -> Result<Vec<Prepared>> {
        let semaphore = Arc::new(Semaphore::new(self.config.indexing.extract_concurrency.max(1)));
        let mut set: JoinSet<Prepared> = JoinSet::new();

        for (file, stored_hash) in candidates {
            let semaphore = semaphore.clone();
            let reader = self.reader.clone();
            let abs = root.join(&file.rel_path);
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Prepared::Vanished {
                        rel_path: file.rel_path,
                    };
                };
                tokio::task::spawn_blocking(move || {
                    prepare_file(&abs, file, stored_hash, reader.as_ref())
                })
                .await
                .unwrap_or_else(|e| {
                    Prepared::Failed(FailedDocument {
                        path: String::new(),
                        kind: ErrorKind::PartialIndexFailure,
                        message: format!("extraction task failed: {}", e),
                    })
                })
            });
        }

        let mut out = Vec::new();
        loop {
            let next = cancel
                .run(set.join_next())
                .await
                .ok_or(IndexError::Cancelled)?;
            match next {
                Some(Ok(prepared)) => out.push(prepared),
                Some(Err(e)) => return Err(IndexError::io("extraction worker", e)),
                None => break,
            }
        }
        out.sort_by(|a, b| prepared_path(a).cmp(prepared_path(b)));
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn embed_and_commit(
        &self,
        storage: &FolderStorage,
        model_id: &str,
        dims: usize,
        pending: &mut [PendingDocument],
        report: &mut RunReport,
        progress: &mut FolderProgress,
        cancel: &CancelToken,
        on_progress: &ProgressFn<'_>,
    ) -> Result<()> {
        // Empty documents have nothing to embed.
        for doc in pending.iter().filter(|d| d.chunks.is_empty()) {
            self.commit(storage, dims, doc, report, progress).await?;
            on_progress(progress);
        }

        let queue: Vec<(usize, usize)> = pending
            .iter()
            .enumerate()
            .flat_map(|(d, doc)| (0..doc.chunks.len()).map(move |c| (d, c)))
            .collect();
        if queue.is_empty() {
            return Ok(());
        }

        let batch_size = self
            .pool
            .batch_size(model_id)
            .await
            .map_err(|e| e.into_index_error(model_id))?;

        for batch in queue.chunks(batch_size) {
            check_cancel(cancel)?;
            let live: Vec<(usize, usize)> = batch
                .iter()
                .copied()
                .filter(|(d, _)| !pending[*d].failed)
                .collect();
            if live.is_empty() {
                continue;
            }
            let texts: Vec<String> = live
                .iter()
                .map(|(d, c)| pending[*d].chunks[*c].text.clone())
                .collect();

            let touched_docs: BTreeSet<usize> = live.iter().map(|(d, _)| *d).collect();
            match self.embed_with_retry(model_id, &texts, cancel).await {
                Ok(vectors) => {
                    for ((d, _), vector) in live.iter().zip(vectors) {
                        pending[*d].vectors.push(vector);
                    }
                    for d in touched_docs {
                        let doc = &pending[d];
                        if doc.vectors.len() == doc.chunks.len() {
                            self.commit(storage, dims, doc, report, progress).await?;
                            on_progress(progress);
                        }
                    }
                }
                Err(IndexError::Cancelled) => return Err(IndexError::Cancelled),
                Err(e) => {
                    for d in touched_docs {
                        let doc = &mut pending[d];
                        doc.failed = true;
                        tracing::warn!(path = %doc.document.path, error = %e, "embedding failed");
                        report.failed.push(FailedDocument {
                            path: doc.document.path.clone(),
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                        progress.files_failed += 1;
                    }
                    progress.recompute_percent();
                    on_progress(progress);
                }
            }
        }

        // Every batch succeeded yet a document is short of vectors: the
        // backend's output cannot be trusted for it.
        let mut incomplete = false;
        for doc in pending
            .iter_mut()
            .filter(|d| !d.failed && d.vectors.len() != d.chunks.len())
        {
            doc.failed = true;
            incomplete = true;
            tracing::warn!(
                path = %doc.document.path,
                chunks = doc.chunks.len(),
                vectors = doc.vectors.len(),
                "document left without a vector per chunk"
            );
            report.failed.push(FailedDocument {
                path: doc.document.path.clone(),
                kind: ErrorKind::PartialIndexFailure,
                message: format!(
                    "expected {} chunk vectors, got {}",
                    doc.chunks.len(),
                    doc.vectors.len()
                ),
            });
            progress.files_failed += 1;
        }
        if incomplete {
            progress.recompute_percent();
            on_progress(progress);
        }
        Ok(())
    }

    /// Embed one batch, retrying transient failures with exponential backoff.
    async fn embed_with_retry(
        &self,
        model_id: &str,
        texts: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<f32>>> {
        let max_retries = self.config.embedding.max_retries;
        let backoff = self.config.embedding.retry_backoff_ms;
        let mut attempt = 0u32;
        loop {
            match self.pool.embed_batch(model_id, texts, cancel).await {
                Ok(vectors) => return Ok(vectors),
                Err(EmbedError::Cancelled) => return Err(IndexError::Cancelled),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    let delay = Duration::from_millis(backoff.saturating_mul(1 << attempt.min(16)));
                    tracing::warn!(
                        model = %model_id,
                        attempt = attempt + 1,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "embedding batch failed, retrying"
                    );
                    if !cancel.sleep(delay).await {
                        return Err(IndexError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e.into_index_error(model_id)),
            }
        }
    }

    async fn commit(
        &self,
        storage: &FolderStorage,
        dims: usize,
        doc: &PendingDocument,
        report: &mut RunReport,
        progress: &mut FolderProgress,
    ) -> Result<()> {
        let doc_vector = mean_vector(&doc.vectors);
        storage
            .vectors
            .replace_document(
                dims,
                &doc.document,
                &doc.chunks,
                &doc.vectors,
                doc_vector.as_deref(),
            )
            .await?;
        storage
            .fingerprints
            .upsert(&doc.document.path, &doc.document.fingerprint)
            .await?;

        report.indexed += 1;
        report.chunks_written += doc.chunks.len();
        progress.files_indexed += 1;
        progress.bytes_indexed += doc.document.fingerprint.size;
        progress.recompute_percent();
        tracing::debug!(path = %doc.document.path, chunks = doc.chunks.len(), "document indexed");
        Ok(())
    }
}

/// Hash a candidate and, if its content changed, extract its text.
/// Runs on a blocking thread.
fn prepare_file(
    abs: &Path,
    file: ScannedFile,
    stored_hash: Option<String>,
    reader: &dyn DocumentReader,
) -> Prepared {
    let rel_path = file.rel_path;
    let fingerprint = match fingerprint::compute(abs) {
        Ok(fp) => fp,
        Err(_) if !abs.exists() => return Prepared::Vanished { rel_path },
        Err(e) => {
            return Prepared::Failed(FailedDocument {
                path: rel_path,
                kind: e.kind(),
                message: e.to_string(),
            })
        }
    };

    if stored_hash.as_deref() == Some(fingerprint.content_hash.as_str()) {
        return Prepared::Touched {
            rel_path,
            fingerprint,
        };
    }

    match reader.read(abs) {
        Ok(text) => Prepared::Changed {
            rel_path,
            fingerprint,
            text,
        },
        Err(ExtractError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Prepared::Vanished { rel_path }
        }
        Err(e) => Prepared::Failed(FailedDocument {
            path: rel_path,
            kind: ErrorKind::PartialIndexFailure,
            message: e.to_string(),
        }),
    }
}

fn prepared_path(p: &Prepared) -> &str {
    match p {
        Prepared::Touched { rel_path, .. }
        | Prepared::Changed { rel_path, .. }
        | Prepared::Vanished { rel_path } => rel_path,
        Prepared::Failed(f) => &f.path,
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(IndexError::Cancelled)
    } else {
        Ok(())
    }
}

