//! In-process CPU backend built on fastembed's ONNX runtime.
//!
//! Models are loaded from the shared model cache rather than fastembed's own
//! download directory, so the same verified artifacts serve every folder.

use async_trait::async_trait;
use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{l2_normalize, validate_batch, EmbedError, EmbeddingBackend};
use crate::model_registry::{BackendKind, ModelDescriptor};

const DEFAULT_BATCH_SIZE: usize = 32;

pub struct LocalBackend {
    model_id: String,
    dims: usize,
    model: Arc<Mutex<TextEmbedding>>,
}

impl LocalBackend {
    /// Load the model from cached files keyed by logical name.
    pub async fn load(
        descriptor: &ModelDescriptor,
        files: HashMap<String, PathBuf>,
    ) -> Result<Self, EmbedError> {
        let model_id = descriptor.id.clone();
        let model = tokio::task::spawn_blocking(move || load_blocking(&files))
            .await
            .map_err(|e| EmbedError::Backend(e.to_string()))??;

        tracing::info!(model = %model_id, "local embedding model loaded");
        Ok(Self {
            model_id,
            dims: descriptor.dims,
            model: Arc::new(Mutex::new(model)),
        })
    }
}

fn load_blocking(files: &HashMap<String, PathBuf>) -> Result<TextEmbedding, EmbedError> {
    let read = |name: &str| -> Result<Vec<u8>, EmbedError> {
        let path = files
            .get(name)
            .ok_or_else(|| EmbedError::Backend(format!("model file {} missing from cache", name)))?;
        std::fs::read(path).map_err(|e| EmbedError::Backend(format!("read {}: {}", name, e)))
    };

    let onnx = read("model.onnx")?;
    let tokenizer_files = TokenizerFiles {
        tokenizer_file: read("tokenizer.json")?,
        config_file: read("config.json")?,
        special_tokens_map_file: read("special_tokens_map.json")?,
        tokenizer_config_file: read("tokenizer_config.json")?,
    };
    let user_model = UserDefinedEmbeddingModel::new(onnx, tokenizer_files).with_pooling(Pooling::Mean);

    TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
        .map_err(|e| EmbedError::Backend(format!("failed to initialize local model: {}", e)))
}

#[async_trait]
impl EmbeddingBackend for LocalBackend {
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
        DEFAULT_BATCH_SIZE
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.clone();
        let texts = texts.to_vec();
        let count = texts.len();

        let mut vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| EmbedError::Backend("local model lock poisoned".to_string()))?;
            model
                .embed(texts, Some(DEFAULT_BATCH_SIZE))
                .map_err(|e| EmbedError::Backend(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| EmbedError::Backend(e.to_string()))??;

        validate_batch(&vectors, count, self.dims)?;
        for v in vectors.iter_mut() {
            l2_normalize(v);
        }
        Ok(vectors)
    }
}
