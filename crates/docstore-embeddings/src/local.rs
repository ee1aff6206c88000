//! In-process embeddings using fastembed.

use async_trait::async_trait;
use docstore_core::storage::{Embedder, Embedding};
use docstore_core::{Error, Result};
use std::sync::{Arc, Mutex};

/// Embedding generator using fastembed.
pub struct LocalEmbedder {
    model: Arc<Mutex<fastembed::TextEmbedding>>,
    model_id: String,
}

impl LocalEmbedder {
    /// Create a new embedding generator with the default model.
    pub fn new() -> Result<Self> {
        Self::with_model("sentence-transformers/all-MiniLM-L6-v2")
    }

    /// Create a new embedding generator reporting `model_name`.
    pub fn with_model(model_name: &str) -> Result<Self> {
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(true),
        )
        .map_err(|e| Error::Embedding(e.to_string()))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            model_id: model_name.to_string(),
        })
    }

    /// Get the model ID.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().map_err(|e| Error::Embedding(e.to_string()))?;
            model
                .embed(texts, None)
                .map_err(|e| Error::Embedding(e.to_string()))
        })
        .await
        .map_err(|e| Error::Embedding(e.to_string()))?
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let vector = self
            .run(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("No embedding generated".to_string()))?;
        Ok(Embedding::new(vector, self.model_id.clone()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(self
            .run(texts.to_vec())
            .await?
            .into_iter()
            .map(|vector| Embedding::new(vector, self.model_id.clone()))
            .collect())
    }
}
