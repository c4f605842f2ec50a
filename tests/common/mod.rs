#![allow(dead_code)]

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use folder_index::config::{Config, CustomModelConfig};
use folder_index::download::MemoryFetcher;
use folder_index::embedding::{l2_normalize, BackendFactory, EmbedError, EmbeddingBackend, EmbeddingPool};
use folder_index::extract::FileDocumentReader;
use folder_index::ingest::Orchestrator;
use folder_index::manager::FolderManager;
use folder_index::model_registry::{BackendKind, ModelArtifact, ModelDescriptor, ModelRegistry};
use folder_index::search::QueryEngine;
use folder_index::store::FolderStorage;

pub const MODEL: &str = "bow-64";
pub const SMALL_MODEL: &str = "bow-32";
/// Same vectors as [`MODEL`], but its files must be downloaded first.
pub const REMOTE_MODEL: &str = "bow-remote";
/// Points at files the fetcher does not have until a test inserts them.
pub const MISSING_MODEL: &str = "bow-missing";

pub const REMOTE_URL: &str = "mem://models/bow-remote/weights.bin";
pub const MISSING_URL: &str = "mem://models/bow-missing/weights.bin";

/// Misbehaviour injected into every backend a [`HashingFactory`] creates.
pub struct Faults {
    /// Batches containing this word wait for [`Faults::release`].
    hold_word: Mutex<Option<String>>,
    gate: Semaphore,
    /// Batches that have started waiting on the gate.
    pub held: AtomicUsize,
    /// Batches containing this word fail with a transient backend error.
    fail_word: Mutex<Option<String>>,
    pub failures: AtomicUsize,
    /// Return one vector fewer than asked for.
    pub drop_last: AtomicBool,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            hold_word: Mutex::new(None),
            gate: Semaphore::new(0),
            held: AtomicUsize::new(0),
            fail_word: Mutex::new(None),
            failures: AtomicUsize::new(0),
            drop_last: AtomicBool::new(false),
        }
    }
}

impl Faults {
    pub fn hold_batches_with(&self, word: &str) {
        *self.hold_word.lock().unwrap() = Some(word.to_string());
    }

    pub fn release(&self) {
        self.gate.add_permits(1 << 20);
    }

    pub fn fail_batches_with(&self, word: &str) {
        *self.fail_word.lock().unwrap() = Some(word.to_string());
    }

    fn mentions(word: &Mutex<Option<String>>, texts: &[String]) -> bool {
        match word.lock().unwrap().as_deref() {
            Some(w) => texts.iter().any(|t| t.contains(w)),
            None => false,
        }
    }
}

/// Deterministic bag-of-words embedder: every lowercase word is hashed
/// into one of `dims` buckets and the counts are normalised. Texts that
/// share words score high.
pub struct HashingBackend {
    model_id: String,
    dims: usize,
    calls: Arc<AtomicUsize>,
    texts: Arc<AtomicUsize>,
    faults: Arc<Faults>,
}

pub fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % dims as u64) as usize] += 1.0;
    }
    l2_normalize(&mut v);
    v
}

#[async_trait]
impl EmbeddingBackend for HashingBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn preferred_batch_size(&self) -> usize {
        8
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if Faults::mentions(&self.faults.hold_word, texts) {
            self.faults.held.fetch_add(1, Ordering::SeqCst);
            let _ = self.faults.gate.acquire().await;
        }
        if Faults::mentions(&self.faults.fail_word, texts) {
            self.faults.failures.fetch_add(1, Ordering::SeqCst);
            return Err(EmbedError::Backend("device lost".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        let mut vectors: Vec<Vec<f32>> = texts.iter().map(|t| hash_embed(t, self.dims)).collect();
        if self.faults.drop_last.load(Ordering::SeqCst) {
            vectors.pop();
        }
        Ok(vectors)
    }
}

#[derive(Default)]
pub struct HashingFactory {
    pub calls: Arc<AtomicUsize>,
    pub texts: Arc<AtomicUsize>,
    pub created: AtomicUsize,
    pub faults: Arc<Faults>,
}

impl HashingFactory {
    pub fn embed_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendFactory for HashingFactory {
    async fn create(
        &self,
        model: &ModelDescriptor,
    ) -> Result<Arc<dyn EmbeddingBackend>, EmbedError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(HashingBackend {
            model_id: model.id.clone(),
            dims: model.dims,
            calls: self.calls.clone(),
            texts: self.texts.clone(),
            faults: self.faults.clone(),
        }))
    }
}

pub fn remote_weights() -> Vec<u8> {
    (0..20_000u32).map(|i| (i % 251) as u8).collect()
}

fn custom_model(id: &str, dims: usize, artifacts: Vec<ModelArtifact>) -> CustomModelConfig {
    CustomModelConfig {
        id: id.into(),
        dims,
        backend: BackendKind::Cpu,
        languages: vec!["en".into()],
        min_memory_mb: 0,
        quality: 1,
        artifacts,
    }
}

fn artifact(url: &str, bytes: &[u8]) -> ModelArtifact {
    ModelArtifact {
        file: "weights.bin".into(),
        url: url.into(),
        sha256: Some(hex::encode(Sha256::digest(bytes))),
        size: Some(bytes.len() as u64),
    }
}

/// A temp directory holding the engine's data dir and any number of
/// folders to index, plus fake embedding and download backends.
pub struct Harness {
    pub root: PathBuf,
    pub config: Config,
    pub factory: Arc<HashingFactory>,
    pub fetcher: Arc<MemoryFetcher>,
    _tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = fs::canonicalize(tmp.path()).unwrap();

        let weights = remote_weights();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(REMOTE_URL, weights.clone());

        let mut config = Config::default();
        config.storage.data_dir = root.join("data");
        config.chunking.max_tokens = 48;
        config.indexing.watch = false;
        config.embedding.default_model = Some(MODEL.into());
        config.embedding.retry_backoff_ms = 10;
        config.models.download_retries = 1;
        config.models.custom = vec![
            custom_model(MODEL, 64, vec![]),
            custom_model(SMALL_MODEL, 32, vec![]),
            custom_model(REMOTE_MODEL, 64, vec![artifact(REMOTE_URL, &weights)]),
            custom_model(MISSING_MODEL, 64, vec![artifact(MISSING_URL, &weights)]),
        ];

        Self {
            root,
            config,
            factory: Arc::new(HashingFactory::default()),
            fetcher,
            _tmp: tmp,
        }
    }

    /// Create an empty folder under the harness root.
    pub fn folder(&self, name: &str) -> PathBuf {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn write(&self, folder: &Path, rel: &str, content: impl AsRef<[u8]>) {
        let path = folder.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// The three-document folder most tests start from.
    pub fn sample_folder(&self, name: &str) -> PathBuf {
        let dir = self.folder(name);
        self.write(
            &dir,
            "alpha.md",
            "# Alpha\n\nThe alpha document is about Rust programming.\n\nIt covers cargo, crates and the borrow checker.",
        );
        self.write(
            &dir,
            "beta.md",
            "# Beta\n\nThe beta document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
        );
        self.write(
            &dir,
            "notes/gamma.txt",
            "Gamma plain text notes.\n\nDeployment and infrastructure: Kubernetes clusters and Docker images.",
        );
        dir
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::with_fetcher(&self.config, self.fetcher.clone()))
    }

    pub fn pool(&self) -> Arc<EmbeddingPool> {
        Arc::new(EmbeddingPool::new(
            self.registry(),
            self.factory.clone(),
            &self.config.embedding,
        ))
    }

    pub fn orchestrator(&self, pool: Arc<EmbeddingPool>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(self.config.clone()),
            pool,
            Arc::new(FileDocumentReader),
        )
        .unwrap()
    }

    pub fn engine(&self, pool: Arc<EmbeddingPool>) -> QueryEngine {
        QueryEngine::new(pool, self.config.retrieval.clone())
    }

    pub async fn storage(&self, name: &str) -> FolderStorage {
        FolderStorage::open(&self.config.folders_dir().join(name))
            .await
            .unwrap()
    }

    pub async fn manager(&self) -> FolderManager {
        FolderManager::with_parts(
            Arc::new(self.config.clone()),
            self.registry(),
            self.factory.clone(),
            Arc::new(FileDocumentReader),
        )
        .await
        .unwrap()
    }
}

pub fn is_settled(state: &str) -> bool {
    matches!(state, "active" | "error")
}
