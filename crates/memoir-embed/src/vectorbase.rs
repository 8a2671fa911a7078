//! Append-only matrix of unit vectors with cosine top-K lookup.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{Array2, ArrayView1};

use crate::EmbeddingModel;

const DEFAULT_MAX_HITS: usize = 10;

/// A row ordinal with its cosine similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredOrdinal {
    pub ordinal: usize,
    pub score: f32,
}

/// Append-only dense `N x D` matrix of normalized embeddings plus the
/// companion list of indexed texts. Row `i` is the embedding of `texts[i]`.
pub struct VectorBase {
    model: Arc<dyn EmbeddingModel>,
    dimension: usize,
    vectors: Array2<f32>,
    texts: Vec<String>,
}

impl VectorBase {
    pub fn new(model: Arc<dyn EmbeddingModel>) -> Self {
        let dimension = model.dimension();
        Self {
            model,
            dimension,
            vectors: Array2::zeros((0, dimension)),
            texts: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn text(&self, ordinal: usize) -> Option<&str> {
        self.texts.get(ordinal).map(|s| s.as_str())
    }

    pub fn model(&self) -> &Arc<dyn EmbeddingModel> {
        &self.model
    }

    /// Append a precomputed embedding; returns its ordinal.
    pub fn push_embedding(&mut self, text: &str, embedding: &[f32]) -> Result<usize> {
        if embedding.len() != self.dimension {
            return Err(anyhow!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            ));
        }
        let ordinal = self.len();
        self.vectors
            .push_row(ArrayView1::from(embedding))
            .map_err(|e| anyhow!("failed to append embedding row: {}", e))?;
        self.texts.push(text.to_string());
        Ok(ordinal)
    }

    /// Embed `text` and append the row; returns its ordinal.
    pub async fn add_key(&mut self, text: &str) -> Result<usize> {
        let embedding = self.model.embed(text).await?;
        self.push_embedding(text, &embedding)
    }

    /// Batched form of [`VectorBase::add_key`].
    pub async fn add_keys(&mut self, texts: &[String]) -> Result<()> {
        if texts.is_empty() {
            return Ok(());
        }
        let embeddings = self.model.embed_batch(texts).await?;
        for (text, embedding) in texts.iter().zip(embeddings) {
            self.push_embedding(text, &embedding)?;
        }
        Ok(())
    }

    /// Embed `key` and return rows with `score >= min_score` (default 0.0),
    /// sorted descending, truncated to `max_hits` (default 10). Ties break
    /// by ascending ordinal.
    pub async fn fuzzy_lookup(
        &self,
        key: &str,
        max_hits: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<ScoredOrdinal>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.model.embed(key).await?;
        Ok(self.nearest(&embedding, max_hits, min_score))
    }

    /// Cosine top-K against a precomputed query embedding.
    pub fn nearest(
        &self,
        query: &[f32],
        max_hits: Option<usize>,
        min_score: Option<f32>,
    ) -> Vec<ScoredOrdinal> {
        if self.is_empty() || query.len() != self.dimension {
            return Vec::new();
        }
        let min_score = min_score.unwrap_or(0.0);
        let scores = self.vectors.dot(&ArrayView1::from(query));
        let mut scored: Vec<ScoredOrdinal> = scores
            .iter()
            .enumerate()
            .filter(|(_, &score)| score >= min_score)
            .map(|(ordinal, &score)| ScoredOrdinal { ordinal, score })
            .collect();
        sort_and_truncate(&mut scored, max_hits.unwrap_or(DEFAULT_MAX_HITS));
        scored
    }

    /// Cosine top-K restricted to the given row ordinals.
    pub fn nearest_in_subset(
        &self,
        query: &[f32],
        ordinals: &[usize],
        max_hits: Option<usize>,
        min_score: Option<f32>,
    ) -> Vec<ScoredOrdinal> {
        if query.len() != self.dimension {
            return Vec::new();
        }
        let min_score = min_score.unwrap_or(0.0);
        let query = ArrayView1::from(query);
        let mut scored: Vec<ScoredOrdinal> = ordinals
            .iter()
            .filter(|&&ordinal| ordinal < self.len())
            .map(|&ordinal| ScoredOrdinal {
                ordinal,
                score: self.vectors.row(ordinal).dot(&query),
            })
            .filter(|s| s.score >= min_score)
            .collect();
        sort_and_truncate(&mut scored, max_hits.unwrap_or(usize::MAX));
        scored
    }

    /// Raw float32 bytes of the matrix, row-major little-endian. The
    /// companion text list is serialized separately.
    pub fn serialize_embeddings(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len() * self.dimension * 4);
        for row in self.vectors.rows() {
            for value in row {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        bytes
    }

    /// Rebuild from a text list plus the raw bytes produced by
    /// [`VectorBase::serialize_embeddings`].
    pub fn restore(&mut self, texts: Vec<String>, bytes: &[u8]) -> Result<()> {
        let expected = texts.len() * self.dimension * 4;
        if bytes.len() != expected {
            return Err(anyhow!(
                "embedding blob length mismatch: expected {} bytes for {} rows, got {}",
                expected,
                texts.len(),
                bytes.len()
            ));
        }
        self.clear();
        for (i, text) in texts.iter().enumerate() {
            let row = decode_embedding(&bytes[i * self.dimension * 4..(i + 1) * self.dimension * 4]);
            self.push_embedding(text, &row)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.vectors = Array2::zeros((0, self.dimension));
        self.texts.clear();
    }
}

fn sort_and_truncate(scored: &mut Vec<ScoredOrdinal>, max_hits: usize) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.ordinal.cmp(&b.ordinal))
    });
    scored.truncate(max_hits);
}

/// Decode little-endian float32 bytes into a vector.
pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Encode a vector as little-endian float32 bytes.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEmbeddingModel;

    fn base() -> VectorBase {
        VectorBase::new(Arc::new(MockEmbeddingModel::new(32)))
    }

    #[tokio::test]
    async fn add_key_returns_dense_ordinals() {
        let mut base = base();
        assert_eq!(base.add_key("one").await.unwrap(), 0);
        assert_eq!(base.add_key("two").await.unwrap(), 1);
        assert_eq!(base.len(), 2);
        assert_eq!(base.texts(), &["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn fuzzy_lookup_finds_exact_key_first() {
        let mut base = base();
        base.add_keys(&["apple".into(), "banana".into(), "cherry".into()])
            .await
            .unwrap();
        let hits = base.fuzzy_lookup("banana", Some(1), None).await.unwrap();
        assert_eq!(hits[0].ordinal, 1);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn rows_stay_normalized() {
        let mut base = base();
        base.add_keys(&["x y z".into(), "hello world".into()])
            .await
            .unwrap();
        for row in base.vectors.rows() {
            let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[tokio::test]
    async fn serialize_restore_round_trips() {
        let mut base = base();
        base.add_keys(&["alpha".into(), "beta".into()]).await.unwrap();
        let bytes = base.serialize_embeddings();
        let texts = base.texts().to_vec();
        let before = base.fuzzy_lookup("alpha", Some(2), None).await.unwrap();

        let mut restored = VectorBase::new(Arc::new(MockEmbeddingModel::new(32)));
        restored.restore(texts, &bytes).unwrap();
        let after = restored.fuzzy_lookup("alpha", Some(2), None).await.unwrap();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.ordinal, b.ordinal);
            assert!((a.score - b.score).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn subset_lookup_ignores_rows_outside_subset() {
        let mut base = base();
        base.add_keys(&["red".into(), "green".into(), "blue".into()])
            .await
            .unwrap();
        let query = base.model().embed("red").await.unwrap();
        let hits = base.nearest_in_subset(&query, &[1, 2], None, None);
        assert!(hits.iter().all(|h| h.ordinal != 0));
    }
}
