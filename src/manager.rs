//! Folder lifecycle manager.
//!
//! Owns every watched folder. Each folder gets one worker task that walks
//! the lifecycle (`pending → scanning → downloading_model → indexing →
//! active`) by applying events to [`lifecycle::transition`], then sleeps
//! until a filesystem change, a retry or cancellation wakes it. Triggers
//! that arrive while a run is in progress collapse into one follow-up
//! run, so a folder never has two runs at once.
//!
//! Every state or progress change is published on a broadcast channel as a
//! [`FolderSnapshot`]. A failure in one folder's task only moves that
//! folder to `error`.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::embedding::{BackendFactory, DefaultBackendFactory, EmbeddingPool};
use crate::error::{IndexError, Result};
use crate::extract::{DocumentReader, FileDocumentReader};
use crate::hardware;
use crate::ingest::Orchestrator;
use crate::lifecycle::{transition, FolderEvent, FolderState};
use crate::model_registry::{ModelDescriptor, ModelRegistry, ModelStatus};
use crate::models::{FolderErrorInfo, FolderProgress, FolderSnapshot, RowCounts};
use crate::scan::scan_folder;
use crate::search::{ChunkHit, ChunkQuery, DocumentHit, DocumentQuery, FolderScope, Page, QueryEngine};
use crate::store::{storage_key, FolderStorage};
use crate::watcher::FolderWatcher;

const EVENT_CAPACITY: usize = 1024;

/// What a model change would discard, shown to the caller before it
/// happens.
#[derive(Debug, Clone, Serialize)]
pub struct ModelChangeImpact {
    pub folder: PathBuf,
    pub from_model: String,
    pub to_model: String,
    pub from_dims: Option<usize>,
    pub to_dims: usize,
    pub documents: i64,
    pub chunks: i64,
}

#[derive(Debug, Clone)]
pub enum ModelChangeOutcome {
    Applied(FolderSnapshot),
    Declined,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    pub folder: PathBuf,
    /// Rows deleted with the folder's private storage.
    pub removed_rows: RowCounts,
    pub storage_dir: PathBuf,
}

struct FolderStatus {
    model_id: String,
    state: FolderState,
    progress: FolderProgress,
}

/// State shared between the manager and one folder's worker.
struct FolderShared {
    path: PathBuf,
    storage: Arc<FolderStorage>,
    status: Mutex<FolderStatus>,
    trigger: Arc<Notify>,
    events: broadcast::Sender<FolderSnapshot>,
}

impl FolderShared {
    fn status(&self) -> MutexGuard<'_, FolderStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> FolderState {
        self.status().state.clone()
    }

    fn model_id(&self) -> String {
        self.status().model_id.clone()
    }

    fn snapshot(&self) -> FolderSnapshot {
        let status = self.status();
        FolderSnapshot {
            path: self.path.clone(),
            model_id: status.model_id.clone(),
            state: status.state.name().to_string(),
            progress: status.progress.clone(),
            download_percent: match status.state {
                FolderState::DownloadingModel { percent } => Some(percent),
                _ => None,
            },
            error: match &status.state {
                FolderState::Error { kind, message } => Some(FolderErrorInfo {
                    kind: *kind,
                    message: message.clone(),
                    retryable: status.state.is_retryable(),
                }),
                _ => None,
            },
        }
    }

    /// Apply `event` and publish the new snapshot. Returns false when the
    /// event is not valid in the current state.
    fn apply(&self, event: FolderEvent) -> bool {
        {
            let mut status = self.status();
            match transition(&status.state, &event) {
                Ok(next) => {
                    if next.name() != status.state.name() {
                        tracing::info!(
                            folder = %self.path.display(),
                            from = status.state.name(),
                            to = next.name(),
                            "folder state changed"
                        );
                    }
                    if let FolderState::Error { kind, message } = &next {
                        tracing::error!(folder = %self.path.display(), kind = %kind, error = %message, "folder failed");
                    }
                    status.state = next;
                }
                Err(e) => {
                    tracing::warn!(folder = %self.path.display(), error = %e, "ignored lifecycle event");
                    return false;
                }
            }
        }
        self.publish();
        true
    }

    fn set_progress(&self, progress: FolderProgress) {
        self.status().progress = progress;
        self.publish();
    }

    fn set_model(&self, model_id: &str) {
        let mut status = self.status();
        status.model_id = model_id.to_string();
        status.progress = FolderProgress::default();
    }

    fn publish(&self) {
        // No subscribers is fine.
        let _ = self.events.send(self.snapshot());
    }
}

struct FolderHandle {
    shared: Arc<FolderShared>,
    cancel: CancelToken,
    task: Option<JoinHandle<()>>,
    _watcher: Option<FolderWatcher>,
}

impl FolderHandle {
    /// Cancel the worker and wait for it to stop.
    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(folder = %self.shared.path.display(), "folder worker panicked");
                }
            }
        }
    }
}

/// Everything a folder worker needs, cheap to clone into each task.
#[derive(Clone)]
struct Services {
    config: Arc<Config>,
    registry: Arc<ModelRegistry>,
    orchestrator: Arc<Orchestrator>,
}

pub struct FolderManager {
    services: Services,
    pool: Arc<EmbeddingPool>,
    engine: QueryEngine,
    catalog: Catalog,
    folders: tokio::sync::Mutex<HashMap<PathBuf, FolderHandle>>,
    /// Serialises model changes, which release the folder map while they
    /// wait for a run to stop.
    model_changes: tokio::sync::Mutex<()>,
    events: broadcast::Sender<FolderSnapshot>,
}

impl FolderManager {
    /// Manager with HTTP model downloads, the default embedding backends
    /// and the file-extension document reader.
    pub async fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::from_config(&config)?);
        let factory = Arc::new(DefaultBackendFactory::new(
            registry.clone(),
            config.embedding.clone(),
        ));
        Self::with_parts(Arc::new(config), registry, factory, Arc::new(FileDocumentReader)).await
    }

    pub async fn with_parts(
        config: Arc<Config>,
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn BackendFactory>,
        reader: Arc<dyn DocumentReader>,
    ) -> Result<Self> {
        let pool = Arc::new(EmbeddingPool::new(
            registry.clone(),
            factory,
            &config.embedding,
        ));
        let orchestrator = Arc::new(Orchestrator::new(config.clone(), pool.clone(), reader)?);
        let catalog = Catalog::open(&config.catalog_path()).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            engine: QueryEngine::new(pool.clone(), config.retrieval.clone()),
            services: Services {
                config,
                registry,
                orchestrator,
            },
            pool,
            catalog,
            folders: tokio::sync::Mutex::new(HashMap::new()),
            model_changes: tokio::sync::Mutex::new(()),
            events,
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.services.registry
    }

    pub fn pool(&self) -> &Arc<EmbeddingPool> {
        &self.pool
    }

    /// Resume every folder recorded in the catalog. Each one re-enters the
    /// lifecycle at `pending` and runs an incremental pass.
    pub async fn start(&self) -> Result<usize> {
        let entries = self.catalog.list().await?;
        let mut folders = self.folders.lock().await;
        let mut resumed = 0;
        for entry in entries {
            if folders.contains_key(&entry.path) {
                continue;
            }
            let dir = self.services.config.folders_dir().join(&entry.storage_key);
            let storage = FolderStorage::open(&dir).await?;
            let handle = self.start_folder(entry.path.clone(), storage, entry.model_id);
            folders.insert(entry.path, handle);
            resumed += 1;
        }
        tracing::info!(folders = resumed, "resumed watched folders");
        Ok(resumed)
    }

    /// Start watching `path`. Without `model_id` the configured default or
    /// the hardware recommendation is used.
    ///
    /// Validation failures are returned here and never reach the state
    /// machine.
    pub async fn add_folder(&self, path: &Path, model_id: Option<&str>) -> Result<FolderSnapshot> {
        let folder = validate_folder(path)?;
        let model_id = self.resolve_model(model_id).await?;

        let mut folders = self.folders.lock().await;
        let mut watched: Vec<PathBuf> = folders.keys().cloned().collect();
        watched.extend(self.catalog.list().await?.into_iter().map(|e| e.path));
        if watched.contains(&folder) {
            return Err(IndexError::invalid_folder(&folder, "folder is already watched"));
        }
        for existing in &watched {
            if folder.starts_with(existing) {
                return Err(IndexError::invalid_folder(
                    &folder,
                    format!("folder is inside watched folder {}", existing.display()),
                ));
            }
            if existing.starts_with(&folder) {
                return Err(IndexError::invalid_folder(
                    &folder,
                    format!("folder contains watched folder {}", existing.display()),
                ));
            }
        }
        let data_dir = std::fs::canonicalize(&self.services.config.storage.data_dir)
            .unwrap_or_else(|_| self.services.config.storage.data_dir.clone());
        if data_dir.starts_with(&folder) || folder.starts_with(&data_dir) {
            return Err(IndexError::invalid_folder(
                &folder,
                "folder overlaps the index data directory",
            ));
        }

        let key = storage_key(&folder);
        let storage = FolderStorage::open(&self.services.config.folders_dir().join(&key)).await?;
        // Leftovers from an earlier, interrupted removal.
        storage.purge().await?;
        self.catalog.insert(&folder, &key, &model_id).await?;

        tracing::info!(folder = %folder.display(), model = %model_id, "folder added");
        let handle = self.start_folder(folder.clone(), storage, model_id);
        let snapshot = handle.shared.snapshot();
        folders.insert(folder, handle);
        Ok(snapshot)
    }

    /// Stop watching `path` and delete its private storage.
    ///
    /// In-flight work for the folder is cancelled first; other folders are
    /// not affected. The catalog entry goes last, so a removal that fails
    /// partway can be finished by calling this again.
    pub async fn remove_folder(&self, path: &Path) -> Result<RemovalReport> {
        let key = folder_key(path);
        let handle = self.folders.lock().await.remove(&key);
        let Some(mut handle) = handle else {
            return self.remove_stopped(&key).await;
        };

        handle.stop().await;
        let storage = handle.shared.storage.clone();
        let model_id = handle.shared.model_id();
        let cleanup = async {
            let removed_rows = storage.row_counts().await?;
            storage.destroy().await?;
            self.catalog.remove(&key).await?;
            Ok::<_, IndexError>(removed_rows)
        }
        .await;
        let removed_rows = match cleanup {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(folder = %key.display(), error = %e, "folder removal incomplete");
                return Err(e);
            }
        };

        handle.shared.apply(FolderEvent::Removed);
        self.release_if_unused(&model_id).await;

        tracing::info!(
            folder = %key.display(),
            documents = removed_rows.documents,
            chunks = removed_rows.chunks,
            "folder removed"
        );
        Ok(RemovalReport {
            folder: key,
            removed_rows,
            storage_dir: storage.dir().to_path_buf(),
        })
    }

    /// Remove a cataloged folder that has no worker: one whose earlier
    /// removal failed partway, or one this manager has not started.
    async fn remove_stopped(&self, key: &Path) -> Result<RemovalReport> {
        let entry = self
            .catalog
            .get(key)
            .await?
            .ok_or_else(|| IndexError::UnknownFolder(key.to_path_buf()))?;
        let dir = self.services.config.folders_dir().join(&entry.storage_key);
        let storage = FolderStorage::open(&dir).await?;
        let removed_rows = storage.row_counts().await?;
        storage.destroy().await?;
        self.catalog.remove(&entry.path).await?;

        tracing::info!(
            folder = %entry.path.display(),
            documents = removed_rows.documents,
            "stopped folder removed"
        );
        Ok(RemovalReport {
            folder: entry.path,
            removed_rows,
            storage_dir: dir,
        })
    }

    /// Switch a folder to another model. This discards the folder's whole
    /// index, so `confirm` sees what would be lost and decides.
    ///
    /// Other folders stay usable throughout: the manager's folder map is
    /// not locked while `confirm` runs or while the old run winds down.
    pub async fn change_model<F>(
        &self,
        path: &Path,
        model_id: &str,
        confirm: F,
    ) -> Result<ModelChangeOutcome>
    where
        F: FnOnce(&ModelChangeImpact) -> bool,
    {
        let new_model = self.services.registry.get(model_id)?.clone();
        let key = folder_key(path);
        let _serial = self.model_changes.lock().await;

        let (old_model, storage) = {
            let folders = self.folders.lock().await;
            let handle = folders
                .get(&key)
                .ok_or_else(|| IndexError::UnknownFolder(key.clone()))?;
            (handle.shared.model_id(), handle.shared.storage.clone())
        };
        if old_model == new_model.id {
            return Ok(ModelChangeOutcome::Unchanged);
        }

        let counts = storage.row_counts().await?;
        let impact = ModelChangeImpact {
            folder: key.clone(),
            from_model: old_model.clone(),
            to_model: new_model.id.clone(),
            from_dims: self.services.registry.get(&old_model).ok().map(|m| m.dims),
            to_dims: new_model.dims,
            documents: counts.documents,
            chunks: counts.chunks,
        };
        if !confirm(&impact) {
            tracing::info!(folder = %key.display(), to = %new_model.id, "model change declined");
            return Ok(ModelChangeOutcome::Declined);
        }

        let (cancel, task) = {
            let mut folders = self.folders.lock().await;
            let handle = folders
                .get_mut(&key)
                .ok_or_else(|| IndexError::UnknownFolder(key.clone()))?;
            (handle.cancel.clone(), handle.task.take())
        };
        cancel.cancel();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(folder = %key.display(), "folder worker panicked");
                }
            }
        }
        storage.purge().await?;
        self.catalog.set_model(&key, &new_model.id).await?;

        let snapshot = {
            let mut folders = self.folders.lock().await;
            let handle = folders
                .get_mut(&key)
                .ok_or_else(|| IndexError::UnknownFolder(key.clone()))?;
            handle.shared.set_model(&new_model.id);
            handle.shared.apply(FolderEvent::ModelChanged);
            handle.cancel = CancelToken::new();
            handle.task = Some(spawn_worker(
                self.services.clone(),
                handle.shared.clone(),
                handle.cancel.clone(),
            ));
            handle.shared.snapshot()
        };

        tracing::info!(folder = %key.display(), from = %old_model, to = %new_model.id, "model changed");
        self.release_if_unused(&old_model).await;
        Ok(ModelChangeOutcome::Applied(snapshot))
    }

    /// Resume a folder in a recoverable `error` state.
    pub async fn retry_folder(&self, path: &Path) -> Result<FolderSnapshot> {
        let key = folder_key(path);
        let folders = self.folders.lock().await;
        let handle = folders
            .get(&key)
            .ok_or_else(|| IndexError::UnknownFolder(key.clone()))?;

        let state = handle.shared.state();
        if !state.is_retryable() {
            return Err(IndexError::invalid_folder(
                &key,
                format!("folder is {} and cannot be retried", state),
            ));
        }
        handle.shared.apply(FolderEvent::Retry);
        handle.shared.trigger.notify_one();
        Ok(handle.shared.snapshot())
    }

    /// Ask for an incremental pass, as a filesystem change would.
    pub async fn reindex(&self, path: &Path) -> Result<()> {
        let key = folder_key(path);
        let folders = self.folders.lock().await;
        let handle = folders
            .get(&key)
            .ok_or_else(|| IndexError::UnknownFolder(key.clone()))?;
        handle.shared.trigger.notify_one();
        Ok(())
    }

    /// Snapshots of every watched folder, sorted by path.
    pub async fn get_snapshot(&self) -> Vec<FolderSnapshot> {
        let folders = self.folders.lock().await;
        let mut snapshots: Vec<FolderSnapshot> =
            folders.values().map(|h| h.shared.snapshot()).collect();
        snapshots.sort_by(|a, b| a.path.cmp(&b.path));
        snapshots
    }

    pub async fn folder(&self, path: &Path) -> Result<FolderSnapshot> {
        let key = folder_key(path);
        let folders = self.folders.lock().await;
        folders
            .get(&key)
            .map(|h| h.shared.snapshot())
            .ok_or(IndexError::UnknownFolder(key))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FolderSnapshot> {
        self.events.subscribe()
    }

    /// Wait until the folder's snapshot satisfies `done`.
    pub async fn wait_for<F>(&self, path: &Path, done: F) -> Result<FolderSnapshot>
    where
        F: Fn(&FolderSnapshot) -> bool,
    {
        let key = folder_key(path);
        let mut rx = self.subscribe();
        let current = self.folder(&key).await?;
        if done(&current) {
            return Ok(current);
        }
        loop {
            match rx.recv().await {
                Ok(snapshot) if snapshot.path == key && done(&snapshot) => return Ok(snapshot),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let current = self.folder(&key).await?;
                    if done(&current) {
                        return Ok(current);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(IndexError::Cancelled),
            }
        }
    }

    pub async fn search_chunks(&self, folder: &Path, query: &ChunkQuery) -> Result<Page<ChunkHit>> {
        let (key, storage, model_id) = self.query_target(folder).await?;
        let dims = self.services.registry.get(&model_id)?.dims;
        let scope = FolderScope {
            folder: &key,
            store: &storage.vectors,
            model_id: &model_id,
            dims,
        };
        self.engine.search_chunks(&scope, query).await
    }

    pub async fn find_documents(
        &self,
        folder: &Path,
        query: &DocumentQuery,
    ) -> Result<Page<DocumentHit>> {
        let (key, storage, model_id) = self.query_target(folder).await?;
        let dims = self.services.registry.get(&model_id)?.dims;
        let scope = FolderScope {
            folder: &key,
            store: &storage.vectors,
            model_id: &model_id,
            dims,
        };
        self.engine.find_documents(&scope, query).await
    }

    pub async fn get_document(&self, folder: &Path, path: &str) -> Result<crate::get::DocumentText> {
        let (_, storage, _) = self.query_target(folder).await?;
        crate::get::get_document(&storage.vectors, path).await
    }

    pub async fn list_models(&self) -> Vec<ModelStatus> {
        self.services.registry.list_models().await
    }

    pub async fn recommended_model(&self) -> Option<ModelDescriptor> {
        let profile = hardware::detect().await;
        self.services.registry.recommend_model(profile).cloned()
    }

    /// Cancel all folder work and close every store. Committed documents
    /// stay indexed; anything in flight is picked up on the next start.
    pub async fn shutdown(&self) {
        let handles: Vec<FolderHandle> = self.folders.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.cancel.cancel();
        }
        for mut handle in handles {
            handle.stop().await;
            handle.shared.storage.vectors.close().await;
            handle.shared.storage.fingerprints.close().await;
        }
        self.pool.shutdown().await;
        self.catalog.close().await;
        tracing::info!("folder manager stopped");
    }

    fn start_folder(&self, path: PathBuf, storage: FolderStorage, model_id: String) -> FolderHandle {
        let trigger = Arc::new(Notify::new());
        let shared = Arc::new(FolderShared {
            path: path.clone(),
            storage: Arc::new(storage),
            status: Mutex::new(FolderStatus {
                model_id,
                state: FolderState::Pending,
                progress: FolderProgress::default(),
            }),
            trigger: trigger.clone(),
            events: self.events.clone(),
        });
        shared.publish();

        let watcher = if self.services.config.indexing.watch {
            match FolderWatcher::start(
                &path,
                self.services.orchestrator.rules().clone(),
                Duration::from_millis(self.services.config.indexing.debounce_ms),
                trigger,
            ) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(folder = %path.display(), error = %e, "not watching folder for changes");
                    None
                }
            }
        } else {
            None
        };

        let cancel = CancelToken::new();
        let task = spawn_worker(self.services.clone(), shared.clone(), cancel.clone());
        FolderHandle {
            shared,
            cancel,
            task: Some(task),
            _watcher: watcher,
        }
    }

    async fn resolve_model(&self, requested: Option<&str>) -> Result<String> {
        let registry = &self.services.registry;
        if let Some(id) = requested.or(self.services.config.embedding.default_model.as_deref()) {
            return Ok(registry.get(id)?.id.clone());
        }
        let profile = hardware::detect().await;
        registry
            .recommend_model(profile)
            .map(|m| m.id.clone())
            .ok_or_else(|| IndexError::UnsupportedModel("no model fits this machine".into()))
    }

    async fn query_target(&self, folder: &Path) -> Result<(PathBuf, Arc<FolderStorage>, String)> {
        let key = folder_key(folder);
        let folders = self.folders.lock().await;
        let handle = folders
            .get(&key)
            .ok_or_else(|| IndexError::UnknownFolder(key.clone()))?;
        Ok((key, handle.shared.storage.clone(), handle.shared.model_id()))
    }

    /// Stop the backend for `model_id` when no folder uses it any more.
    async fn release_if_unused(&self, model_id: &str) {
        let in_use = self
            .folders
            .lock()
            .await
            .values()
            .any(|h| h.shared.model_id() == model_id);
        if !in_use {
            self.pool.release(model_id).await;
        }
    }
}

fn spawn_worker(services: Services, shared: Arc<FolderShared>, cancel: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move { run_worker(services, shared, cancel).await })
}

async fn run_worker(services: Services, shared: Arc<FolderShared>, cancel: CancelToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let step = match shared.state() {
            FolderState::Pending => Ok(FolderEvent::Started),
            FolderState::Scanning => scan_step(&services, &shared, &cancel).await,
            FolderState::DownloadingModel { .. } => download_step(&services, &shared, &cancel).await,
            FolderState::Indexing => index_step(&services, &shared, &cancel).await,
            FolderState::Active | FolderState::Error { .. } => {
                if cancel.run(shared.trigger.notified()).await.is_none() {
                    return;
                }
                if matches!(shared.state(), FolderState::Active) {
                    Ok(FolderEvent::ChangeDetected)
                } else {
                    continue;
                }
            }
            FolderState::Removed => return,
        };

        match step {
            Ok(event) => {
                shared.apply(event);
            }
            Err(IndexError::Cancelled) => return,
            Err(e) => {
                shared.apply(FolderEvent::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Enumerate the folder for progress totals and check the model cache.
async fn scan_step(
    services: &Services,
    shared: &Arc<FolderShared>,
    cancel: &CancelToken,
) -> Result<FolderEvent> {
    let files = with_backoff(services, cancel, &shared.path, "scan", || {
        let root = shared.path.clone();
        let rules = services.orchestrator.rules().clone();
        async move {
            tokio::task::spawn_blocking(move || scan_folder(&root, &rules))
                .await
                .map_err(|e| IndexError::io("scan", e))?
        }
    })
    .await?
    .files;

    shared.set_progress(FolderProgress {
        files_total: files.len() as u64,
        bytes_total: files.iter().map(|f| f.size).sum(),
        ..Default::default()
    });

    let model_id = shared.model_id();
    services.registry.get(&model_id)?;
    Ok(FolderEvent::Scanned {
        model_ready: services.registry.is_ready(&model_id).await,
    })
}

async fn download_step(
    services: &Services,
    shared: &Arc<FolderShared>,
    cancel: &CancelToken,
) -> Result<FolderEvent> {
    let model_id = shared.model_id();
    let progress_target = shared.clone();
    let on_progress = move |percent: f32| {
        progress_target.apply(FolderEvent::DownloadProgress { percent });
    };
    services
        .registry
        .acquire(&model_id, cancel, &on_progress)
        .await?;
    Ok(FolderEvent::DownloadCompleted)
}

async fn index_step(
    services: &Services,
    shared: &Arc<FolderShared>,
    cancel: &CancelToken,
) -> Result<FolderEvent> {
    let model_id = shared.model_id();
    let progress_target = shared.clone();
    let on_progress = move |progress: &FolderProgress| {
        progress_target.set_progress(progress.clone());
    };

    let report = with_backoff(services, cancel, &shared.path, "index", || {
        services
            .orchestrator
            .run(&shared.path, &shared.storage, &model_id, cancel, &on_progress)
    })
    .await?;

    if report.is_partial() {
        tracing::warn!(
            folder = %shared.path.display(),
            failed = report.failed.len(),
            "folder indexed with failures"
        );
    }
    Ok(FolderEvent::IndexCompleted)
}

/// Retry transient failures of a folder step with exponential backoff.
async fn with_backoff<T, F, Fut>(
    services: &Services,
    cancel: &CancelToken,
    folder: &Path,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = services.config.embedding.max_retries;
    let backoff_ms = services.config.embedding.retry_backoff_ms;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = Duration::from_millis(backoff_ms.saturating_mul(1 << attempt.min(16)));
                tracing::warn!(
                    folder = %folder.display(),
                    step = what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "folder step failed, retrying"
                );
                if !cancel.sleep(delay).await {
                    return Err(IndexError::Cancelled);
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Check a folder path for `add_folder` and return its canonical form.
fn validate_folder(path: &Path) -> Result<PathBuf> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| IndexError::invalid_folder(path, format!("cannot access folder: {}", e)))?;
    if !metadata.is_dir() {
        return Err(IndexError::invalid_folder(path, "not a directory"));
    }
    std::fs::canonicalize(path)
        .map_err(|e| IndexError::invalid_folder(path, format!("cannot resolve folder: {}", e)))
}

/// Map key for a folder: canonical when it still exists on disk.
fn folder_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
