//! The embedding backend pool.
//!
//! One backend per model id, created lazily the first time a folder or a
//! query needs it and shared by every folder using that model. Backends of
//! different models run independently; a worker backend serialises its own
//! requests. Every call takes the caller's [`CancelToken`] so removing one
//! folder cancels only that folder's batches. A backend left idle for
//! `embedding.health_check_secs` is health-checked before its next batch
//! and restarted if the check fails.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use super::worker::{ProcessLauncher, WorkerBackend};
use super::{validate_batch, EmbedError, EmbeddingBackend};
use crate::cancel::CancelToken;
use crate::config::EmbeddingConfig;
use crate::model_registry::{BackendKind, ModelDescriptor, ModelRegistry};

/// Creates a backend for a model whose artifacts are already cached.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(
        &self,
        model: &ModelDescriptor,
    ) -> Result<Arc<dyn EmbeddingBackend>, EmbedError>;
}

/// Production factory: CPU models run in-process, GPU models in the
/// configured worker process.
pub struct DefaultBackendFactory {
    registry: Arc<ModelRegistry>,
    config: EmbeddingConfig,
}

impl DefaultBackendFactory {
    pub fn new(registry: Arc<ModelRegistry>, config: EmbeddingConfig) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(
        &self,
        model: &ModelDescriptor,
    ) -> Result<Arc<dyn EmbeddingBackend>, EmbedError> {
        let files = self
            .registry
            .model_files(&model.id)
            .await
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;

        match model.backend {
            BackendKind::Cpu => create_local(model, files).await,
            BackendKind::Gpu => {
                let worker = self.config.gpu_worker.clone().ok_or_else(|| {
                    EmbedError::Unavailable(format!(
                        "{} needs embedding.gpu_worker to be configured",
                        model.id
                    ))
                })?;
                let startup = Duration::from_secs(worker.startup_timeout_secs);
                let backend = WorkerBackend::start(
                    model,
                    files.into_iter().collect::<BTreeMap<_, _>>(),
                    Box::new(ProcessLauncher::new(worker)),
                    startup,
                    Duration::from_secs(self.config.timeout_secs),
                )
                .await?;
                Ok(Arc::new(backend))
            }
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn create_local(
    model: &ModelDescriptor,
    files: HashMap<String, std::path::PathBuf>,
) -> Result<Arc<dyn EmbeddingBackend>, EmbedError> {
    let backend = super::local::LocalBackend::load(model, files).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
async fn create_local(
    model: &ModelDescriptor,
    _files: HashMap<String, std::path::PathBuf>,
) -> Result<Arc<dyn EmbeddingBackend>, EmbedError> {
    Err(EmbedError::Unavailable(format!(
        "{} requires --features local-embeddings-fastembed",
        model.id
    )))
}

type BackendCell = Arc<OnceCell<Arc<dyn EmbeddingBackend>>>;

pub struct EmbeddingPool {
    registry: Arc<ModelRegistry>,
    factory: Arc<dyn BackendFactory>,
    backends: Mutex<HashMap<String, BackendCell>>,
    last_used: Mutex<HashMap<String, Instant>>,
    health_interval: Duration,
    batch_size: usize,
}

impl EmbeddingPool {
    pub fn new(
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn BackendFactory>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            registry,
            factory,
            backends: Mutex::new(HashMap::new()),
            last_used: Mutex::new(HashMap::new()),
            health_interval: Duration::from_secs(config.health_check_secs),
            batch_size: config.batch_size,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The backend for `model_id`, creating it on first use.
    pub async fn backend(&self, model_id: &str) -> Result<Arc<dyn EmbeddingBackend>, EmbedError> {
        let descriptor = self
            .registry
            .get(model_id)
            .map_err(|_| EmbedError::Unavailable(model_id.to_string()))?
            .clone();

        let cell = {
            let mut backends = self
                .backends
                .lock()
                .map_err(|_| EmbedError::Backend("backend map poisoned".to_string()))?;
            backends
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let backend = cell
            .get_or_try_init(|| async {
                tracing::info!(model = %descriptor.id, backend = %descriptor.backend, "creating embedding backend");
                self.factory.create(&descriptor).await
            })
            .await?;
        Ok(backend.clone())
    }

    /// Texts per batch for `model_id`: the configured override, else the
    /// backend's preference.
    pub async fn batch_size(&self, model_id: &str) -> Result<usize, EmbedError> {
        if self.batch_size > 0 {
            return Ok(self.batch_size);
        }
        Ok(self.backend(model_id).await?.preferred_batch_size().max(1))
    }

    /// Embed `texts` with `model_id`, preserving input order.
    ///
    /// A worker crash restarts the backend and retries the batch once.
    pub async fn embed_batch(
        &self,
        model_id: &str,
        texts: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let backend = cancel
            .run(self.backend(model_id))
            .await
            .ok_or(EmbedError::Cancelled)??;

        if self.idle_too_long(model_id) {
            let health = cancel
                .run(backend.health_check())
                .await
                .ok_or(EmbedError::Cancelled)?;
            if let Err(e) = health {
                tracing::warn!(model = %model_id, error = %e, "backend failed health check, restarting");
                cancel
                    .run(backend.restart())
                    .await
                    .ok_or(EmbedError::Cancelled)??;
            }
        }

        let outcome = cancel.run(backend.embed_batch(texts)).await;
        self.touch(model_id);
        let vectors = match outcome {
            None => return Err(EmbedError::Cancelled),
            Some(Err(EmbedError::WorkerCrashed(reason))) => {
                tracing::warn!(model = %model_id, reason = %reason, "backend crashed mid-batch, restarting");
                cancel
                    .run(backend.restart())
                    .await
                    .ok_or(EmbedError::Cancelled)??;
                let retried = cancel.run(backend.embed_batch(texts)).await;
                self.touch(model_id);
                retried.ok_or(EmbedError::Cancelled)??
            }
            Some(result) => result?,
        };
        validate_batch(&vectors, texts.len(), backend.dims())?;
        Ok(vectors)
    }

    /// Whether `model_id`'s backend has sat unused past the health-check
    /// interval. A backend that has never run a batch is fresh.
    fn idle_too_long(&self, model_id: &str) -> bool {
        self.last_used
            .lock()
            .ok()
            .and_then(|m| m.get(model_id).copied())
            .is_some_and(|t| t.elapsed() >= self.health_interval)
    }

    fn touch(&self, model_id: &str) {
        if let Ok(mut m) = self.last_used.lock() {
            m.insert(model_id.to_string(), Instant::now());
        }
    }

    pub async fn embed_query(
        &self,
        model_id: &str,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, EmbedError> {
        self.embed_batch(model_id, &[text.to_string()], cancel)
            .await?
            .into_iter()
            .next()
            .ok_or(EmbedError::CountMismatch {
                expected: 1,
                actual: 0,
            })
    }

    /// Stop and forget the backend for `model_id`, if one is running.
    pub async fn release(&self, model_id: &str) {
        if let Ok(mut m) = self.last_used.lock() {
            m.remove(model_id);
        }
        let cell = self
            .backends
            .lock()
            .ok()
            .and_then(|mut b| b.remove(model_id));
        if let Some(backend) = cell.and_then(|c| c.get().cloned()) {
            backend.shutdown().await;
        }
    }

    pub async fn shutdown(&self) {
        let cells: Vec<BackendCell> = match self.backends.lock() {
            Ok(mut b) => b.drain().map(|(_, c)| c).collect(),
            Err(_) => Vec::new(),
        };
        for cell in cells {
            if let Some(backend) = cell.get() {
                backend.shutdown().await;
            }
        }
    }
}
