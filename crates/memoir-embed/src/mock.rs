//! Deterministic offline embedding model for tests and dry runs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::Result;
use async_trait::async_trait;

use crate::{normalize_in_place, EmbeddingModel};

/// Bag-of-words hash embeddings: each lowercased token hashes to a fixed
/// pseudo-random unit direction and the text embeds as the normalized sum.
/// Identical texts embed identically; texts sharing tokens score high.
#[derive(Debug, Clone)]
pub struct MockEmbeddingModel {
    dimension: usize,
}

impl MockEmbeddingModel {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension);
        for component in 0..self.dimension {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            component.hash(&mut hasher);
            let bits = hasher.finish();
            // Map the hash to [-1, 1).
            vector.push((bits as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32);
        }
        vector
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut sum = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            for (slot, value) in sum.iter_mut().zip(self.token_vector(token)) {
                *slot += value;
            }
        }
        normalize_in_place(&mut sum);
        sum
    }
}

#[async_trait]
impl EmbeddingModel for MockEmbeddingModel {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn identical_text_embeds_identically() {
        let model = MockEmbeddingModel::new(64);
        let a = model.embed("hello world").await.unwrap();
        let b = model.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert!((dot(&a, &b) - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn shared_tokens_score_higher_than_disjoint() {
        let model = MockEmbeddingModel::new(64);
        let query = model.embed("greeting").await.unwrap();
        let near = model.embed("hello greeting").await.unwrap();
        let far = model.embed("farewell").await.unwrap();
        assert!(dot(&query, &near) > dot(&query, &far));
    }

    #[tokio::test]
    async fn vectors_are_normalized() {
        let model = MockEmbeddingModel::new(64);
        let v = model.embed("normalization check").await.unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
