//! Process-wide embedding cache keyed by exact text.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::EmbeddingModel;

/// Shared cache of embeddings, guarded by a single lock. Owned by whoever
/// constructs the model wrapper; never a process global.
#[derive(Default)]
pub struct EmbeddingCache {
    entries: Mutex<HashMap<String, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.entries.lock().unwrap().get(text).cloned()
    }

    pub fn put(&self, text: &str, embedding: Vec<f32>) {
        self.entries
            .lock()
            .unwrap()
            .insert(text.to_string(), embedding);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Wraps an embedding model with the shared cache. Single-text embeds are
/// served from the cache; batched embeds go straight to the model so bulk
/// indexing does not flood the cache.
#[derive(Clone)]
pub struct CachingEmbeddingModel {
    inner: Arc<dyn EmbeddingModel>,
    cache: Arc<EmbeddingCache>,
}

impl CachingEmbeddingModel {
    pub fn new(inner: Arc<dyn EmbeddingModel>, cache: Arc<EmbeddingCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Batched embedding that consults and fills the cache, for callers
    /// that re-embed small recurring term sets.
    pub async fn embed_batch_cached(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.cache.get(t)).collect();
        let missing: Vec<String> = texts
            .iter()
            .zip(&results)
            .filter(|(_, hit)| hit.is_none())
            .map(|(text, _)| text.clone())
            .collect();
        if !missing.is_empty() {
            let fresh = self.inner.embed_batch(&missing).await?;
            let mut fresh_iter = fresh.into_iter();
            for (text, slot) in texts.iter().zip(results.iter_mut()) {
                if slot.is_none() {
                    let embedding = fresh_iter
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("embedding batch came back short"))?;
                    self.cache.put(text, embedding.clone());
                    *slot = Some(embedding);
                }
            }
        }
        Ok(results.into_iter().map(|r| r.unwrap()).collect())
    }
}

#[async_trait]
impl EmbeddingModel for CachingEmbeddingModel {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit);
        }
        let embedding = self.inner.embed(text).await?;
        self.cache.put(text, embedding.clone());
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.inner.embed_batch(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEmbeddingModel;

    #[tokio::test]
    async fn identical_text_is_embedded_once() {
        let cache = Arc::new(EmbeddingCache::new());
        let model = CachingEmbeddingModel::new(Arc::new(MockEmbeddingModel::new(16)), cache);
        let first = model.embed("hello").await.unwrap();
        let second = model.embed("hello").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(model.cache().len(), 1);
    }

    #[tokio::test]
    async fn bulk_batches_bypass_the_cache() {
        let cache = Arc::new(EmbeddingCache::new());
        let model = CachingEmbeddingModel::new(Arc::new(MockEmbeddingModel::new(16)), cache);
        model
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert!(model.cache().is_empty());
    }

    #[tokio::test]
    async fn cached_batch_mixes_cached_and_fresh() {
        let cache = Arc::new(EmbeddingCache::new());
        let model = CachingEmbeddingModel::new(Arc::new(MockEmbeddingModel::new(16)), cache);
        let single = model.embed("alpha").await.unwrap();
        let batch = model
            .embed_batch_cached(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(batch[0], single);
        assert_eq!(model.cache().len(), 2);
    }
}
