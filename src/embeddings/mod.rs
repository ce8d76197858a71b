// Embeddings module
// Turns path strings into fixed-dimension vectors through a pluggable model

pub mod hashed;
pub mod ollama;

use anyhow::Result;

use crate::config::{Config, EmbeddingProvider};

pub use hashed::HashedEmbedder;
pub use ollama::OllamaClient;

/// A text embedding model.
///
/// Implementations must be deterministic for a given `model_id`: the persisted
/// index is only reused when the model id and dimension match.
pub trait Embedder: Send + Sync {
    /// Identifier recorded in the index manifest.
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Embed every text, returning one vector of `dimension()` floats per input,
    /// in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Create the embedder selected by `embedding.provider`.
#[inline]
pub fn create_embedder(config: &Config) -> Result<Box<dyn Embedder>> {
    match config.embedding.provider {
        EmbeddingProvider::Ollama => Ok(Box::new(OllamaClient::new(config)?)),
        EmbeddingProvider::Hashed => Ok(Box::new(HashedEmbedder::new(
            config.embedding_dimension(),
        ))),
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
#[inline]
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}
