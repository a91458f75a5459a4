use crate::config::DedupConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Text embedding backend used for near-duplicate detection.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts. Defaults to one call per text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Cosine similarity in `[-1, 1]`. Mismatched lengths and zero vectors
/// compare as `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(feature = "embeddings")]
mod local {
    use super::Embedder;
    use anyhow::Result;
    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
    use std::sync::{Arc, Mutex};
    use tracing::info;

    /// Local ONNX embeddings via fastembed. Downloads the model on first use.
    pub struct LocalEmbedder {
        model: Arc<Mutex<TextEmbedding>>,
    }

    impl LocalEmbedder {
        pub fn new(model_name: &str) -> Result<Self> {
            let model_type = match model_name {
                "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
                "BAAI/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
                _ => anyhow::bail!(
                    "unsupported embedding model '{}'; use BAAI/bge-small-en-v1.5 or BAAI/bge-base-en-v1.5",
                    model_name
                ),
            };
            let model = TextEmbedding::try_new(TextInitOptions::new(model_type))?;
            info!("embedding model loaded: {}", model_name);
            Ok(Self {
                model: Arc::new(Mutex::new(model)),
            })
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut batch = self.embed_batch(&[text.to_string()]).await?;
            batch
                .pop()
                .ok_or_else(|| anyhow::anyhow!("empty embedding result"))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let model = self.model.clone();
            let docs = texts.to_vec();
            // inference is CPU bound
            tokio::task::spawn_blocking(move || {
                let mut model = model.lock().map_err(|e| anyhow::anyhow!("{e}"))?;
                Ok(model.embed(docs, None)?)
            })
            .await?
        }
    }
}

#[cfg(feature = "embeddings")]
pub use local::LocalEmbedder;

/// Build the embedder `dedup` asks for. `None` when dedup is disabled, when
/// the model cannot be loaded, or when the `embeddings` feature is off.
pub fn embedder_from_config(dedup: &DedupConfig) -> Option<Arc<dyn Embedder>> {
    if !dedup.enabled {
        return None;
    }
    #[cfg(feature = "embeddings")]
    {
        match LocalEmbedder::new(&dedup.model) {
            Ok(embedder) => Some(Arc::new(embedder) as Arc<dyn Embedder>),
            Err(e) => {
                warn!("context.dedup disabled, embedding model failed to load: {}", e);
                None
            }
        }
    }
    #[cfg(not(feature = "embeddings"))]
    {
        warn!(
            "context.dedup.enabled is set but parlance was built without the embeddings feature; \
             model '{}' not loaded",
            dedup.model
        );
        None
    }
}

#[cfg(test)]
mod tests;
