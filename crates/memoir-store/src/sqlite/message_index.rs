//! SQLite-backed message text index. Embedding blobs persist in the
//! MessageTextIndex table; an in-process vector base mirrors them for
//! ranking and is rehydrated from the table at startup.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::debug;

use memoir_core::{
    ConversationMessage, MessageOrdinal, MessageTextIndex, ScoredMessageOrdinal,
    ScoredTextLocation, TextEmbeddingIndexSettings, TextLocation,
};
use memoir_embed::{encode_embedding, EmbeddingModel, VectorBase};

use crate::memory::message_index::{rows_for_messages, to_scored_messages};

struct Mirror {
    base: VectorBase,
    locations: Vec<TextLocation>,
}

pub struct SqliteMessageTextIndex {
    pool: SqlitePool,
    model: Arc<dyn EmbeddingModel>,
    mirror: RwLock<Mirror>,
    settings: TextEmbeddingIndexSettings,
}

impl SqliteMessageTextIndex {
    pub fn new(
        pool: SqlitePool,
        model: Arc<dyn EmbeddingModel>,
        settings: TextEmbeddingIndexSettings,
    ) -> Self {
        Self {
            pool,
            model: model.clone(),
            mirror: RwLock::new(Mirror {
                base: VectorBase::new(model),
                locations: Vec::new(),
            }),
            settings,
        }
    }

    /// Stream persisted embedding blobs back into the in-process vector
    /// base, in (msg_id, chunk_ordinal) order.
    pub async fn rehydrate(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT msg_id, chunk_ordinal, embedding FROM MessageTextIndex ORDER BY msg_id, chunk_ordinal",
        )
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut mirror = self.mirror.write().await;
        mirror.base.clear();
        mirror.locations.clear();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let embedding = memoir_embed::decode_embedding(&blob);
            // The chunk text is not needed for ranking; rows key by location.
            mirror.base.push_embedding("", &embedding)?;
            mirror.locations.push(TextLocation::new(
                row.get::<i64, _>("msg_id") as usize,
                row.get::<i64, _>("chunk_ordinal") as usize,
            ));
        }
        debug!(rows = rows.len(), "rehydrated message text index");
        Ok(())
    }
}

#[async_trait]
impl MessageTextIndex for SqliteMessageTextIndex {
    async fn size(&self) -> Result<usize> {
        Ok(self.mirror.read().await.base.len())
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
        let embeddings = self.model.embed_batch(&chunks).await?;

        let mut tx = self.pool.begin().await?;
        for (location, embedding) in locations.iter().zip(&embeddings) {
            sqlx::query(
                r#"INSERT OR REPLACE INTO MessageTextIndex (msg_id, chunk_ordinal, embedding)
                   VALUES (?, ?, ?)"#,
            )
            .bind(location.message_ordinal as i64)
            .bind(location.chunk_ordinal as i64)
            .bind(encode_embedding(embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut mirror = self.mirror.write().await;
        for ((chunk, location), embedding) in chunks.iter().zip(&locations).zip(&embeddings) {
            mirror.base.push_embedding(chunk, embedding)?;
            mirror.locations.push(*location);
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
        let mirror = self.mirror.read().await;
        let hits = mirror.base.nearest(
            &embedding,
            Some(max_matches.unwrap_or(self.settings.max_matches)),
            Some(threshold_score.unwrap_or(self.settings.min_score)),
        );
        Ok(hits
            .into_iter()
            .map(|hit| ScoredTextLocation {
                text_location: mirror.locations[hit.ordinal],
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
        let mirror = self.mirror.read().await;
        let hits = mirror.base.nearest(
            embedding,
            Some(usize::MAX),
            Some(threshold_score.unwrap_or(self.settings.min_score)),
        );
        Ok(to_scored_messages(
            &mirror.locations,
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
        let mirror = self.mirror.read().await;
        let rows = rows_for_messages(&mirror.locations, ordinals);
        let hits = mirror.base.nearest_in_subset(
            embedding,
            &rows,
            None,
            Some(threshold_score.unwrap_or(0.0)),
        );
        Ok(to_scored_messages(&mirror.locations, hits, max_matches))
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        self.model.embed(text).await
    }
}
