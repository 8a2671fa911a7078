//! SQLite-backed message and semantic-ref collections.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use memoir_core::{
    ConversationMessage, Knowledge, MemoirError, MessageCollection, MessageMeta, MessageOrdinal,
    SemanticRef, SemanticRefCollection, SemanticRefOrdinal, TextRange,
};

use super::timestamps::normalize_optional_timestamp;

pub struct SqliteMessageCollection {
    pool: SqlitePool,
}

impl SqliteMessageCollection {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationMessage> {
        let chunks_json: Option<String> = row.get("chunks");
        let chunk_uri: Option<String> = row.get("chunk_uri");
        let text_chunks: Vec<String> = match chunks_json {
            Some(json) => serde_json::from_str(&json)?,
            None => {
                return Err(MemoirError::storage(format!(
                    "message stores chunks externally ({}); external chunk storage is not loaded",
                    chunk_uri.unwrap_or_default()
                ))
                .into())
            }
        };
        let tags: Vec<String> = row
            .get::<Option<String>, _>("tags")
            .map(|json| serde_json::from_str(&json))
            .transpose()?
            .unwrap_or_default();
        let metadata: MessageMeta = row
            .get::<Option<String>, _>("metadata")
            .map(|json| serde_json::from_str(&json))
            .transpose()?
            .unwrap_or_default();
        Ok(ConversationMessage {
            text_chunks,
            tags,
            timestamp: row.get("start_timestamp"),
            metadata,
        })
    }

    async fn insert_message(
        tx: &mut sqlx::SqliteConnection,
        ordinal: MessageOrdinal,
        message: &ConversationMessage,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO Messages (msg_id, chunks, start_timestamp, tags, metadata)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(ordinal as i64)
        .bind(serde_json::to_string(&message.text_chunks)?)
        .bind(normalize_optional_timestamp(message.timestamp.as_deref())?)
        .bind(serde_json::to_string(&message.tags)?)
        .bind(serde_json::to_string(&message.metadata)?)
        .execute(tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageCollection for SqliteMessageCollection {
    async fn size(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn append(&self, message: ConversationMessage) -> Result<MessageOrdinal> {
        let mut tx = self.pool.begin().await?;
        let ordinal: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Messages")
            .fetch_one(&mut *tx)
            .await?;
        Self::insert_message(&mut *tx, ordinal as usize, &message).await?;
        tx.commit().await?;
        Ok(ordinal as usize)
    }

    async fn extend(&self, messages: Vec<ConversationMessage>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut ordinal: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Messages")
            .fetch_one(&mut *tx)
            .await?;
        for message in &messages {
            Self::insert_message(&mut *tx, ordinal as usize, message).await?;
            ordinal += 1;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, ordinal: MessageOrdinal) -> Result<ConversationMessage> {
        let row = sqlx::query(
            "SELECT chunks, chunk_uri, start_timestamp, tags, metadata FROM Messages WHERE msg_id = ?",
        )
        .bind(ordinal as i64)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MemoirError::integrity(format!("message ordinal {ordinal} not found")))?;
        Self::message_from_row(&row)
    }

    async fn get_slice(&self, start: usize, end: usize) -> Result<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            r#"SELECT chunks, chunk_uri, start_timestamp, tags, metadata FROM Messages
               WHERE msg_id >= ? AND msg_id < ? ORDER BY msg_id"#,
        )
        .bind(start as i64)
        .bind(end as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::message_from_row).collect()
    }

    async fn get_multiple(
        &self,
        ordinals: &[MessageOrdinal],
    ) -> Result<Vec<ConversationMessage>> {
        let mut messages = Vec::with_capacity(ordinals.len());
        for &ordinal in ordinals {
            messages.push(self.get(ordinal).await?);
        }
        Ok(messages)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

pub struct SqliteSemanticRefCollection {
    pool: SqlitePool,
}

impl SqliteSemanticRefCollection {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn semantic_ref_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SemanticRef> {
        let ordinal: i64 = row.get("semref_id");
        let range: TextRange = serde_json::from_str(row.get("range_json"))?;
        let knowledge_type: String = row.get("knowledge_type");
        let payload: serde_json::Value = serde_json::from_str(row.get("knowledge_json"))?;
        let knowledge: Knowledge = serde_json::from_value(serde_json::json!({
            "knowledgeType": knowledge_type,
            "knowledge": payload,
        }))?;
        Ok(SemanticRef::new(ordinal as usize, range, knowledge))
    }

    async fn insert_semantic_ref(
        tx: &mut sqlx::SqliteConnection,
        ordinal: SemanticRefOrdinal,
        semantic_ref: &SemanticRef,
    ) -> Result<()> {
        let wire = serde_json::to_value(&semantic_ref.knowledge)?;
        sqlx::query(
            r#"INSERT INTO SemanticRefs (semref_id, range_json, knowledge_type, knowledge_json)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(ordinal as i64)
        .bind(serde_json::to_string(&semantic_ref.range)?)
        .bind(wire["knowledgeType"].as_str().unwrap_or_default())
        .bind(serde_json::to_string(&wire["knowledge"])?)
        .execute(tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SemanticRefCollection for SqliteSemanticRefCollection {
    async fn size(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM SemanticRefs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn append(&self, semantic_ref: SemanticRef) -> Result<SemanticRefOrdinal> {
        let mut tx = self.pool.begin().await?;
        let ordinal: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM SemanticRefs")
            .fetch_one(&mut *tx)
            .await?;
        Self::insert_semantic_ref(&mut *tx, ordinal as usize, &semantic_ref).await?;
        tx.commit().await?;
        Ok(ordinal as usize)
    }

    async fn extend(&self, semantic_refs: Vec<SemanticRef>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut ordinal: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM SemanticRefs")
            .fetch_one(&mut *tx)
            .await?;
        for semantic_ref in &semantic_refs {
            Self::insert_semantic_ref(&mut *tx, ordinal as usize, semantic_ref).await?;
            ordinal += 1;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, ordinal: SemanticRefOrdinal) -> Result<SemanticRef> {
        let row = sqlx::query(
            "SELECT semref_id, range_json, knowledge_type, knowledge_json FROM SemanticRefs WHERE semref_id = ?",
        )
        .bind(ordinal as i64)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            MemoirError::integrity(format!("semantic ref ordinal {ordinal} not found"))
        })?;
        Self::semantic_ref_from_row(&row)
    }

    async fn get_slice(&self, start: usize, end: usize) -> Result<Vec<SemanticRef>> {
        let rows = sqlx::query(
            r#"SELECT semref_id, range_json, knowledge_type, knowledge_json FROM SemanticRefs
               WHERE semref_id >= ? AND semref_id < ? ORDER BY semref_id"#,
        )
        .bind(start as i64)
        .bind(end as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::semantic_ref_from_row).collect()
    }

    async fn get_multiple(&self, ordinals: &[SemanticRefOrdinal]) -> Result<Vec<SemanticRef>> {
        let mut semantic_refs = Vec::with_capacity(ordinals.len());
        for &ordinal in ordinals {
            semantic_refs.push(self.get(ordinal).await?);
        }
        Ok(semantic_refs)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
