//! # Memoir Embed
//!
//! Embedding model clients (Ollama, OpenAI-compatible, deterministic mock),
//! a process-wide embedding cache, and the append-only vector base used by
//! every embedding-backed index.

pub mod cache;
pub mod client;
pub mod mock;
pub mod vectorbase;

use anyhow::Result;
use async_trait::async_trait;

pub use cache::{CachingEmbeddingModel, EmbeddingCache};
pub use client::{EmbeddingClientConfig, OllamaEmbeddingClient, OpenAiEmbeddingClient};
pub use mock::MockEmbeddingModel;
pub use vectorbase::{decode_embedding, encode_embedding, ScoredOrdinal, VectorBase};

/// Turns text into fixed-dimension unit vectors. All returned vectors are
/// L2-normalized so that a dot product equals cosine similarity.
/// Implementations retry transient failures internally.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// The dimension of every vector this model returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left alone.
pub fn normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0, 4.0];
        normalize_in_place(&mut v);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn normalize_leaves_zero_vector() {
        let mut v = vec![0.0, 0.0];
        normalize_in_place(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
