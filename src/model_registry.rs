//! Embedding model catalog and on-disk model cache.
//!
//! The registry lists the built-in models plus any `[[models.custom]]`
//! entries, reports whether each model's artifacts are cached, recommends a
//! model for the detected hardware, and acquires missing models.
//!
//! Cache layout under the model cache dir:
//!
//! ```text
//! blobs/sha256-<hex>        artifact bytes, shared across models
//! manifests/<model>.json    logical file name -> blob hash
//! partial/<model>/<file>.part
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::download::{self, ArtifactFetcher, DownloadError, HttpFetcher};
use crate::error::{IndexError, Result};
use crate::hardware::HardwareProfile;

/// Which backend runs a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process CPU runtime.
    Cpu,
    /// Out-of-process accelerator worker.
    Gpu,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cpu => f.write_str("cpu"),
            BackendKind::Gpu => f.write_str("gpu"),
        }
    }
}

/// One downloadable file belonging to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Logical file name the backend asks for (`model.onnx`, `tokenizer.json`, ...).
    pub file: String,
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub dims: usize,
    pub backend: BackendKind,
    pub languages: Vec<String>,
    /// Approximate memory needed to run the model, in MiB.
    pub min_memory_mb: u64,
    /// Relative retrieval quality, higher is better.
    pub quality: u8,
    pub artifacts: Vec<ModelArtifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelAvailability {
    Absent,
    Downloading { percent: f32 },
    Ready,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    pub availability: ModelAvailability,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheManifest {
    model_id: String,
    files: BTreeMap<String, String>,
    completed_at: i64,
}

const ONNX_FILES: &[(&str, &str)] = &[
    ("model.onnx", "onnx/model.onnx"),
    ("tokenizer.json", "tokenizer.json"),
    ("config.json", "config.json"),
    ("special_tokens_map.json", "special_tokens_map.json"),
    ("tokenizer_config.json", "tokenizer_config.json"),
];

fn hub_artifacts(hub_url: &str, repo: &str) -> Vec<ModelArtifact> {
    ONNX_FILES
        .iter()
        .map(|(file, path)| ModelArtifact {
            file: file.to_string(),
            url: format!("{}/{}/resolve/main/{}", hub_url.trim_end_matches('/'), repo, path),
            sha256: None,
            size: None,
        })
        .collect()
}

fn builtin_models(hub_url: &str) -> Vec<ModelDescriptor> {
    let en = || vec!["en".to_string()];
    let multi = || {
        ["en", "de", "fr", "es", "it", "pt", "nl", "ru", "zh", "ja", "ko"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
    };
    vec![
        ModelDescriptor {
            id: "all-minilm-l6-v2".into(),
            dims: 384,
            backend: BackendKind::Cpu,
            languages: en(),
            min_memory_mb: 512,
            quality: 40,
            artifacts: hub_artifacts(hub_url, "Xenova/all-MiniLM-L6-v2"),
        },
        ModelDescriptor {
            id: "bge-small-en-v1.5".into(),
            dims: 384,
            backend: BackendKind::Cpu,
            languages: en(),
            min_memory_mb: 768,
            quality: 55,
            artifacts: hub_artifacts(hub_url, "Xenova/bge-small-en-v1.5"),
        },
        ModelDescriptor {
            id: "multilingual-e5-small".into(),
            dims: 384,
            backend: BackendKind::Cpu,
            languages: multi(),
            min_memory_mb: 1024,
            quality: 50,
            artifacts: hub_artifacts(hub_url, "Xenova/multilingual-e5-small"),
        },
        ModelDescriptor {
            id: "bge-base-en-v1.5".into(),
            dims: 768,
            backend: BackendKind::Cpu,
            languages: en(),
            min_memory_mb: 2048,
            quality: 65,
            artifacts: hub_artifacts(hub_url, "Xenova/bge-base-en-v1.5"),
        },
        ModelDescriptor {
            id: "bge-large-en-v1.5".into(),
            dims: 1024,
            backend: BackendKind::Gpu,
            languages: en(),
            min_memory_mb: 2048,
            quality: 75,
            artifacts: hub_artifacts(hub_url, "Xenova/bge-large-en-v1.5"),
        },
        ModelDescriptor {
            id: "bge-m3".into(),
            dims: 1024,
            backend: BackendKind::Gpu,
            languages: multi(),
            min_memory_mb: 6144,
            quality: 85,
            artifacts: hub_artifacts(hub_url, "Xenova/bge-m3"),
        },
    ]
}

/// Reports monotonically increasing overall percentages for a multi-file
/// acquisition.
struct ProgressTracker<'a> {
    files: usize,
    last: Mutex<f32>,
    sink: &'a (dyn Fn(f32) + Send + Sync),
}

impl<'a> ProgressTracker<'a> {
    fn report(&self, completed_files: usize, fraction: f32) {
        let files = self.files.max(1) as f32;
        let percent = ((completed_files as f32 + fraction.clamp(0.0, 1.0)) / files * 100.0)
            .min(100.0);
        if let Ok(mut last) = self.last.lock() {
            if percent > *last {
                *last = percent;
                (self.sink)(percent);
            }
        }
    }
}

pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
    cache_dir: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
    download_retries: u32,
    retry_backoff: Duration,
    gpu_worker_configured: bool,
    acquire_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: Mutex<HashMap<String, f32>>,
}

impl ModelRegistry {
    /// Registry backed by HTTP downloads.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = HttpFetcher::new().map_err(|e| IndexError::ModelAcquisition {
            model_id: String::new(),
            message: e.to_string(),
        })?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    pub fn with_fetcher(config: &Config, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        let mut models = builtin_models(&config.models.hub_url);
        for custom in &config.models.custom {
            let descriptor = ModelDescriptor {
                id: custom.id.clone(),
                dims: custom.dims,
                backend: custom.backend,
                languages: custom.languages.clone(),
                min_memory_mb: custom.min_memory_mb,
                quality: custom.quality,
                artifacts: custom.artifacts.clone(),
            };
            // Custom entries replace built-ins of the same id.
            match models.iter_mut().find(|m| m.id == descriptor.id) {
                Some(existing) => *existing = descriptor,
                None => models.push(descriptor),
            }
        }

        Self {
            models,
            cache_dir: config.model_cache_dir(),
            fetcher,
            download_retries: config.models.download_retries,
            retry_backoff: Duration::from_millis(config.embedding.retry_backoff_ms),
            gpu_worker_configured: config.embedding.gpu_worker.is_some(),
            acquire_locks: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn get(&self, model_id: &str) -> Result<&ModelDescriptor> {
        self.models
            .iter()
            .find(|m| m.id == model_id)
            .ok_or_else(|| IndexError::UnsupportedModel(model_id.to_string()))
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub async fn list_models(&self) -> Vec<ModelStatus> {
        let mut out = Vec::with_capacity(self.models.len());
        for model in &self.models {
            out.push(ModelStatus {
                descriptor: model.clone(),
                availability: self.availability(&model.id).await,
            });
        }
        out
    }

    pub async fn availability(&self, model_id: &str) -> ModelAvailability {
        let downloading = self
            .in_flight
            .lock()
            .ok()
            .and_then(|m| m.get(model_id).copied());
        if let Some(percent) = downloading {
            return ModelAvailability::Downloading { percent };
        }
        if self.is_ready(model_id).await {
            ModelAvailability::Ready
        } else {
            ModelAvailability::Absent
        }
    }

    /// True when every artifact of the model is present in the cache.
    pub async fn is_ready(&self, model_id: &str) -> bool {
        let Ok(model) = self.get(model_id) else {
            return false;
        };
        if model.artifacts.is_empty() {
            return true;
        }
        match self.read_manifest(model_id).await {
            Some(manifest) => model.artifacts.iter().all(|a| {
                manifest
                    .files
                    .get(&a.file)
                    .map(|hash| download::blob_path(&self.blobs_dir(), hash).exists())
                    .unwrap_or(false)
            }),
            None => false,
        }
    }

    /// Resolved paths of a ready model's files, keyed by logical name.
    pub async fn model_files(&self, model_id: &str) -> Result<HashMap<String, PathBuf>> {
        if self.get(model_id)?.artifacts.is_empty() {
            return Ok(HashMap::new());
        }
        let manifest =
            self.read_manifest(model_id)
                .await
                .ok_or_else(|| IndexError::ModelAcquisition {
                    model_id: model_id.to_string(),
                    message: "model is not in the cache".to_string(),
                })?;
        Ok(manifest
            .files
            .iter()
            .map(|(file, hash)| (file.clone(), download::blob_path(&self.blobs_dir(), hash)))
            .collect())
    }

    /// Highest-quality model the hardware can run.
    pub fn recommend_model(&self, hardware: &HardwareProfile) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .filter(|m| match m.backend {
                BackendKind::Gpu => {
                    self.gpu_worker_configured && hardware.gpu_memory_mb() >= m.min_memory_mb
                }
                BackendKind::Cpu => hardware
                    .system_memory_mb
                    .map(|mb| mb >= m.min_memory_mb)
                    .unwrap_or(true),
            })
            .max_by(|a, b| a.quality.cmp(&b.quality).then_with(|| b.id.cmp(&a.id)))
    }

    /// Download every missing artifact of `model_id`.
    ///
    /// Concurrent calls for the same model are serialised; the second caller
    /// finds the model ready. `on_progress` receives strictly increasing
    /// percentages, the last of which is `100.0`.
    pub async fn acquire(
        &self,
        model_id: &str,
        cancel: &CancelToken,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<()> {
        let model = self.get(model_id)?.clone();
        let lock = self.acquire_lock(model_id);
        let _guard = cancel
            .run(lock.lock())
            .await
            .ok_or(IndexError::Cancelled)?;

        if self.is_ready(model_id).await {
            on_progress(100.0);
            return Ok(());
        }

        self.set_in_flight(model_id, Some(0.0));
        let result = self.acquire_locked(&model, cancel, on_progress).await;
        self.set_in_flight(model_id, None);

        result.map_err(|e| match e {
            DownloadError::Cancelled => IndexError::Cancelled,
            other => IndexError::ModelAcquisition {
                model_id: model_id.to_string(),
                message: other.to_string(),
            },
        })
    }

    async fn acquire_locked(
        &self,
        model: &ModelDescriptor,
        cancel: &CancelToken,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> std::result::Result<(), DownloadError> {
        tracing::info!(model = %model.id, files = model.artifacts.len(), "acquiring model");

        let report = |p: f32| {
            self.set_in_flight(&model.id, Some(p));
            on_progress(p);
        };
        let tracker = ProgressTracker {
            files: model.artifacts.len(),
            last: Mutex::new(-1.0),
            sink: &report,
        };
        tracker.report(0, 0.0);

        let blobs = self.blobs_dir();
        let mut files = BTreeMap::new();
        for (index, artifact) in model.artifacts.iter().enumerate() {
            let part = self
                .cache_dir
                .join("partial")
                .join(&model.id)
                .join(format!("{}.part", artifact.file.replace('/', "_")));

            let mut attempt = 0u32;
            let blob = loop {
                let on_bytes = |fraction: f32| tracker.report(index, fraction);
                match download::download_artifact(
                    self.fetcher.as_ref(),
                    artifact,
                    &blobs,
                    &part,
                    cancel,
                    &on_bytes,
                )
                .await
                {
                    Ok(blob) => break blob,
                    Err(e) if e.is_retryable() && attempt < self.download_retries => {
                        attempt += 1;
                        let delay = self.retry_backoff * (1 << (attempt - 1).min(5));
                        tracing::warn!(
                            model = %model.id,
                            file = %artifact.file,
                            attempt,
                            error = %e,
                            "download failed, retrying"
                        );
                        if !cancel.sleep(delay).await {
                            return Err(DownloadError::Cancelled);
                        }
                    }
                    Err(e) => {
                        tracing::error!(model = %model.id, file = %artifact.file, error = %e, "download failed");
                        return Err(e);
                    }
                }
            };
            files.insert(artifact.file.clone(), blob.sha256);
            tracker.report(index + 1, 0.0);
        }

        self.write_manifest(&CacheManifest {
            model_id: model.id.clone(),
            files,
            completed_at: chrono::Utc::now().timestamp(),
        })
        .await?;
        let _ = tokio::fs::remove_dir_all(self.cache_dir.join("partial").join(&model.id)).await;

        // An empty artifact list never reports per-file progress.
        tracker.report(model.artifacts.len().max(1), 0.0);
        tracing::info!(model = %model.id, "model ready");
        Ok(())
    }

    fn acquire_lock(&self, model_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.acquire_locks.lock() {
            Ok(mut locks) => locks
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn set_in_flight(&self, model_id: &str, percent: Option<f32>) {
        if let Ok(mut map) = self.in_flight.lock() {
            match percent {
                Some(p) => {
                    map.insert(model_id.to_string(), p);
                }
                None => {
                    map.remove(model_id);
                }
            }
        }
    }

    fn blobs_dir(&self) -> PathBuf {
        self.cache_dir.join("blobs")
    }

    fn manifest_path(&self, model_id: &str) -> PathBuf {
        self.cache_dir
            .join("manifests")
            .join(format!("{}.json", model_id.replace('/', "_")))
    }

    async fn read_manifest(&self, model_id: &str) -> Option<CacheManifest> {
        let bytes = tokio::fs::read(self.manifest_path(model_id)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_manifest(&self, manifest: &CacheManifest) -> std::result::Result<(), DownloadError> {
        let path = self.manifest_path(&manifest.model_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| DownloadError::Io(std::io::Error::other(e.to_string())))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomModelConfig;
    use crate::download::MemoryFetcher;
    use crate::hardware::GpuInfo;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn config_with_tiny(dir: &Path, bytes: &[u8]) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.to_path_buf();
        config.embedding.retry_backoff_ms = 1;
        config.models.custom.push(CustomModelConfig {
            id: "tiny".into(),
            dims: 8,
            backend: BackendKind::Cpu,
            languages: vec![],
            min_memory_mb: 0,
            quality: 1,
            artifacts: vec![
                ModelArtifact {
                    file: "model.onnx".into(),
                    url: "mem://tiny/model.onnx".into(),
                    sha256: Some(format!("{:x}", Sha256::digest(bytes))),
                    size: Some(bytes.len() as u64),
                },
                ModelArtifact {
                    file: "tokenizer.json".into(),
                    url: "mem://tiny/tokenizer.json".into(),
                    sha256: None,
                    size: None,
                },
            ],
        });
        config
    }

    fn fetcher(bytes: &[u8]) -> Arc<MemoryFetcher> {
        let f = Arc::new(MemoryFetcher::new());
        f.insert("mem://tiny/model.onnx", bytes.to_vec());
        f.insert("mem://tiny/tokenizer.json", b"{}".to_vec());
        f
    }

    #[tokio::test]
    async fn acquire_reports_monotonic_progress_to_100() {
        let tmp = TempDir::new().unwrap();
        let bytes = vec![3u8; 10_000];
        let registry =
            ModelRegistry::with_fetcher(&config_with_tiny(tmp.path(), &bytes), fetcher(&bytes));
        assert_eq!(registry.availability("tiny").await, ModelAvailability::Absent);

        let seen = Mutex::new(Vec::new());
        registry
            .acquire("tiny", &CancelToken::new(), &|p: f32| seen.lock().unwrap().push(p))
            .await
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);
        assert_eq!(seen.last().copied(), Some(100.0));
        assert!(registry.is_ready("tiny").await);
        let files = registry.model_files("tiny").await.unwrap();
        assert_eq!(std::fs::read(&files["model.onnx"]).unwrap(), bytes);
    }

    #[tokio::test]
    async fn checksum_failures_are_retried_then_surface() {
        let tmp = TempDir::new().unwrap();
        let bytes = b"weights".to_vec();
        let f = fetcher(&bytes);
        let registry =
            ModelRegistry::with_fetcher(&config_with_tiny(tmp.path(), &bytes), f.clone());

        f.corrupt_next("mem://tiny/model.onnx", 2);
        registry
            .acquire("tiny", &CancelToken::new(), &|_: f32| {})
            .await
            .unwrap();

        f.corrupt_next("mem://tiny/model.onnx", 100);
        let tmp2 = TempDir::new().unwrap();
        let registry2 =
            ModelRegistry::with_fetcher(&config_with_tiny(tmp2.path(), &bytes), f.clone());
        let err = registry2
            .acquire("tiny", &CancelToken::new(), &|_: f32| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelAcquisition);
        assert!(!registry2.is_ready("tiny").await);
    }

    #[tokio::test]
    async fn unknown_model_is_validation_error() {
        let tmp = TempDir::new().unwrap();
        let registry =
            ModelRegistry::with_fetcher(&config_with_tiny(tmp.path(), b"x"), fetcher(b"x"));
        let err = registry
            .acquire("nope", &CancelToken::new(), &|_: f32| {})
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::UnsupportedModel(_)));
    }

    #[test]
    fn recommends_by_hardware() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = tmp.path().to_path_buf();
        let cpu_only = ModelRegistry::with_fetcher(&config, Arc::new(MemoryFetcher::new()));

        let laptop = HardwareProfile {
            gpu: Some(GpuInfo {
                name: "x".into(),
                memory_mb: 16_000,
            }),
            cpu_cores: 8,
            system_memory_mb: Some(4096),
        };
        // No GPU worker configured: GPU models are never recommended.
        assert_eq!(cpu_only.recommend_model(&laptop).unwrap().id, "bge-base-en-v1.5");

        config.embedding.gpu_worker = Some(crate::config::GpuWorkerConfig {
            command: "worker".into(),
            args: vec![],
            startup_timeout_secs: 1,
        });
        let with_gpu = ModelRegistry::with_fetcher(&config, Arc::new(MemoryFetcher::new()));
        assert_eq!(with_gpu.recommend_model(&laptop).unwrap().id, "bge-m3");

        let tiny = HardwareProfile {
            gpu: None,
            cpu_cores: 1,
            system_memory_mb: Some(600),
        };
        assert_eq!(with_gpu.recommend_model(&tiny).unwrap().id, "all-minilm-l6-v2");
    }
}
