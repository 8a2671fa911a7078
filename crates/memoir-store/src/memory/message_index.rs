//! In-memory per-chunk message text embeddings.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use memoir_core::{
    ConversationMessage, MessageOrdinal, MessageTextIndex, ScoredMessageOrdinal,
    ScoredTextLocation, TextEmbeddingIndexSettings, TextLocation,
};
use memoir_embed::{EmbeddingModel, VectorBase};

struct IndexState {
    base: VectorBase,
    locations: Vec<TextLocation>,
}

/// Per-chunk embedding index: row `i` of the vector base embeds the chunk
/// at `locations[i]`.
pub struct MemoryMessageTextIndex {
    model: Arc<dyn EmbeddingModel>,
    state: RwLock<IndexState>,
    settings: TextEmbeddingIndexSettings,
}

impl MemoryMessageTextIndex {
    pub fn new(model: Arc<dyn EmbeddingModel>, settings: TextEmbeddingIndexSettings) -> Self {
        Self {
            model: model.clone(),
            state: RwLock::new(IndexState {
                base: VectorBase::new(model),
                locations: Vec::new(),
            }),
            settings,
        }
    }

    /// Snapshot as (locations, chunk texts, raw embedding bytes).
    pub async fn to_parts(&self) -> (Vec<TextLocation>, Vec<String>, Vec<u8>) {
        let state = self.state.read().await;
        (
            state.locations.clone(),
            state.base.texts().to_vec(),
            state.base.serialize_embeddings(),
        )
    }

    pub async fn load_parts(
        &self,
        locations: Vec<TextLocation>,
        texts: Vec<String>,
        bytes: &[u8],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.base.restore(texts, bytes)?;
        state.locations = locations;
        Ok(())
    }

}

/// Aggregate chunk hits per message by max score, sort descending, cut.
pub(crate) fn to_scored_messages(
    locations: &[TextLocation],
    hits: impl IntoIterator<Item = memoir_embed::ScoredOrdinal>,
    max_matches: Option<usize>,
) -> Vec<ScoredMessageOrdinal> {
    let mut per_message: HashMap<MessageOrdinal, f32> = HashMap::new();
    for hit in hits {
        let ordinal = locations[hit.ordinal].message_ordinal;
        per_message
            .entry(ordinal)
            .and_modify(|score| *score = score.max(hit.score))
            .or_insert(hit.score);
    }
    let mut matches: Vec<ScoredMessageOrdinal> = per_message
        .into_iter()
        .map(|(message_ordinal, score)| ScoredMessageOrdinal {
            message_ordinal,
            score,
        })
        .collect();
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.message_ordinal.cmp(&b.message_ordinal))
    });
    if let Some(max) = max_matches {
        matches.truncate(max);
    }
    matches
}

/// Rows of the vector base belonging to the given message ordinals.
pub(crate) fn rows_for_messages(
    locations: &[TextLocation],
    ordinals: &[MessageOrdinal],
) -> Vec<usize> {
    locations
        .iter()
        .enumerate()
        .filter(|(_, location)| ordinals.contains(&location.message_ordinal))
        .map(|(row, _)| row)
        .collect()
}

#[async_trait]
impl MessageTextIndex for MemoryMessageTextIndex {
    async fn size(&self) -> Result<usize> {
        Ok(self.state.read().await.base.len())
    }

    async fn add_messages_starting_at(
        &self,
        start_message_ordinal: MessageOrdinal,
        messages: &[ConversationMessage],
    ) -> Result<()> {
        let mut chunks: Vec<String> = Vec::new();
        let mut locations: Vec<TextLocation> = Vec::new();
        for (offset, message) in messages.iter().enumerate() {
            for (chunk_ordinal, chunk) in message.text_chunks.iter().enumerate() {
                chunks.push(chunk.clone());
                locations.push(TextLocation::new(
                    start_message_ordinal + offset,
                    chunk_ordinal,
                ));
            }
        }
        if chunks.is_empty() {
            return Ok(());
        }
        // Bulk path: embed outside the cache in one batch.
        let embeddings = self.model.embed_batch(&chunks).await?;
        let mut state = self.state.write().await;
        for ((chunk, location), embedding) in chunks.iter().zip(&locations).zip(embeddings) {
            state.base.push_embedding(chunk, &embedding)?;
            state.locations.push(*location);
        }
        Ok(())
    }

    async fn lookup_text(
        &self,
        text: &str,
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredTextLocation>> {
        let embedding = self.model.embed(text).await?;
        let state = self.state.read().await;
        let hits = state.base.nearest(
            &embedding,
            Some(max_matches.unwrap_or(self.settings.max_matches)),
            Some(threshold_score.unwrap_or(self.settings.min_score)),
        );
        Ok(hits
            .into_iter()
            .map(|hit| ScoredTextLocation {
                text_location: state.locations[hit.ordinal],
                score: hit.score,
            })
            .collect())
    }

    async fn lookup_messages(
        &self,
        text: &str,
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredMessageOrdinal>> {
        let embedding = self.model.embed(text).await?;
        self.lookup_by_embedding(&embedding, max_matches, threshold_score)
            .await
    }

    async fn lookup_messages_in_subset(
        &self,
        text: &str,
        ordinals: &[MessageOrdinal],
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredMessageOrdinal>> {
        let embedding = self.model.embed(text).await?;
        self.lookup_in_subset_by_embedding(&embedding, ordinals, max_matches, threshold_score)
            .await
    }

    async fn lookup_by_embedding(
        &self,
        embedding: &[f32],
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredMessageOrdinal>> {
        let state = self.state.read().await;
        // Rank all chunks, then aggregate, then cut; cutting chunk hits
        // first could starve messages whose best chunk ranks late.
        let hits = state.base.nearest(
            embedding,
            Some(usize::MAX),
            Some(threshold_score.unwrap_or(self.settings.min_score)),
        );
        Ok(to_scored_messages(
            &state.locations,
            hits,
            Some(max_matches.unwrap_or(self.settings.max_matches)),
        ))
    }

    async fn lookup_in_subset_by_embedding(
        &self,
        embedding: &[f32],
        ordinals: &[MessageOrdinal],
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredMessageOrdinal>> {
        let state = self.state.read().await;
        let rows = rows_for_messages(&state.locations, ordinals);
        let hits = state.base.nearest_in_subset(
            embedding,
            &rows,
            None,
            Some(threshold_score.unwrap_or(0.0)),
        );
        Ok(to_scored_messages(
            &state.locations,
            hits,
            max_matches,
        ))
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        self.model.embed(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::MessageMeta;
    use memoir_embed::MockEmbeddingModel;

    fn message(chunks: &[&str]) -> ConversationMessage {
        ConversationMessage::new(
            chunks.iter().map(|c| c.to_string()).collect(),
            MessageMeta::None,
        )
    }

    fn index() -> MemoryMessageTextIndex {
        MemoryMessageTextIndex::new(
            Arc::new(MockEmbeddingModel::new(64)),
            TextEmbeddingIndexSettings {
                embedding_dimension: 64,
                max_matches: 10,
                min_score: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn indexes_every_chunk() {
        let index = index();
        index
            .add_messages_starting_at(0, &[message(&["a b", "c d"]), message(&["e f"])])
            .await
            .unwrap();
        assert_eq!(index.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn ranks_overlapping_chunk_above_disjoint() {
        let index = index();
        index
            .add_messages_starting_at(
                0,
                &[
                    message(&["hello greeting"]),
                    message(&["farewell"]),
                    message(&["totally unrelated words"]),
                ],
            )
            .await
            .unwrap();
        let matches = index.lookup_messages("greeting", None, None).await.unwrap();
        assert_eq!(matches[0].message_ordinal, 0);
        let farewell = matches.iter().find(|m| m.message_ordinal == 1);
        if let Some(farewell) = farewell {
            assert!(matches[0].score > farewell.score);
        }
        for m in &matches {
            assert!(m.score >= 0.0 && m.score <= 1.0 + 1e-4);
        }
    }

    #[tokio::test]
    async fn chunk_scores_aggregate_per_message_by_max() {
        let index = index();
        index
            .add_messages_starting_at(0, &[message(&["greeting hello", "noise chunk"])])
            .await
            .unwrap();
        let messages = index.lookup_messages("greeting", None, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        let chunks = index.lookup_text("greeting", None, None).await.unwrap();
        let best_chunk = chunks
            .iter()
            .map(|c| c.score)
            .fold(f32::MIN, f32::max);
        assert!((messages[0].score - best_chunk).abs() < 1e-6);
    }

    #[tokio::test]
    async fn subset_lookup_excludes_other_messages() {
        let index = index();
        index
            .add_messages_starting_at(
                0,
                &[
                    message(&["greeting one"]),
                    message(&["greeting two"]),
                    message(&["greeting three"]),
                ],
            )
            .await
            .unwrap();
        let matches = index
            .lookup_messages_in_subset("greeting", &[1, 2], None, None)
            .await
            .unwrap();
        assert!(!matches.is_empty());
        assert!(matches.iter().all(|m| m.message_ordinal != 0));
    }
}
