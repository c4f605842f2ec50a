use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::model_registry::{BackendKind, ModelArtifact};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/fidx")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_ratio: default_overlap_ratio(),
        }
    }
}

fn default_max_tokens() -> usize {
    400
}
fn default_overlap_ratio() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_extract_concurrency")]
    pub extract_concurrency: usize,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_watch")]
    pub watch: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
            extract_concurrency: default_extract_concurrency(),
            debounce_ms: default_debounce_ms(),
            watch: default_watch(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.md", "**/*.txt", "**/*.rst", "**/*.rs", "**/*.py", "**/*.js", "**/*.ts",
        "**/*.tsx", "**/*.jsx", "**/*.go", "**/*.java", "**/*.toml", "**/*.json", "**/*.yaml",
        "**/*.yml", "**/*.html", "**/*.pdf", "**/*.docx", "**/*.pptx", "**/*.xlsx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_extract_concurrency() -> usize {
    4
}
fn default_debounce_ms() -> u64 {
    750
}
fn default_watch() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub default_model: Option<String>,
    /// Chunks per backend call. `0` uses the backend's preferred size.
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// A backend idle at least this long is health-checked before its next
    /// batch.
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
    #[serde(default)]
    pub gpu_worker: Option<GpuWorkerConfig>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            batch_size: 0,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            health_check_secs: default_health_check_secs(),
            gpu_worker: None,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_health_check_secs() -> u64 {
    30
}

/// External process that serves accelerator-backed models.
#[derive(Debug, Deserialize, Clone)]
pub struct GpuWorkerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_startup_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    #[serde(default)]
    pub custom: Vec<CustomModelConfig>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            hub_url: default_hub_url(),
            download_retries: default_download_retries(),
            custom: Vec::new(),
        }
    }
}

fn default_hub_url() -> String {
    "https://huggingface.co".to_string()
}
fn default_download_retries() -> u32 {
    3
}

/// A user-supplied model descriptor.
#[derive(Debug, Deserialize, Clone)]
pub struct CustomModelConfig {
    pub id: String,
    pub dims: usize,
    pub backend: BackendKind,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub min_memory_mb: u64,
    #[serde(default)]
    pub quality: u8,
    #[serde(default)]
    pub artifacts: Vec<ModelArtifact>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Multiplier applied per matched exact term fraction.
    #[serde(default = "default_exact_boost")]
    pub exact_boost: f64,
    /// Score assigned to exact matches that have no semantic component.
    #[serde(default = "default_exact_floor")]
    pub exact_floor: f64,
    #[serde(default)]
    pub min_semantic_score: f64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            exact_boost: default_exact_boost(),
            exact_floor: default_exact_floor(),
            min_semantic_score: 0.0,
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_exact_boost() -> f64 {
    1.0
}
fn default_exact_floor() -> f64 {
    0.35
}
fn default_limit() -> usize {
    10
}
fn default_max_limit() -> usize {
    100
}

impl Config {
    /// Directory holding one private storage directory per folder.
    pub fn folders_dir(&self) -> PathBuf {
        self.storage.data_dir.join("folders")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.storage.data_dir.join("catalog.sqlite")
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.models
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("models"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if !(0.0..0.5).contains(&self.chunking.overlap_ratio) {
            bail!("chunking.overlap_ratio must be in [0.0, 0.5)");
        }
        if self.indexing.extract_concurrency == 0 {
            bail!("indexing.extract_concurrency must be >= 1");
        }
        if self.retrieval.exact_boost < 0.0 {
            bail!("retrieval.exact_boost must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.retrieval.exact_floor) {
            bail!("retrieval.exact_floor must be in [0.0, 1.0]");
        }
        if self.retrieval.default_limit == 0 || self.retrieval.max_limit == 0 {
            bail!("retrieval limits must be >= 1");
        }
        for model in &self.models.custom {
            if model.dims == 0 {
                bail!("models.custom '{}': dims must be > 0", model.id);
            }
        }
        if let Some(worker) = &self.embedding.gpu_worker {
            if worker.command.trim().is_empty() {
                bail!("embedding.gpu_worker.command must not be empty");
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
