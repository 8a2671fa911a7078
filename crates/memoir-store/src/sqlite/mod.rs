//! SQLite storage backend: one database file per conversation.
//!
//! The provider owns a single-connection pool for its lifetime; writers
//! are serialized by that connection and batch writes run inside one
//! transaction. Reads never open a transaction.

pub mod collections;
pub mod indexes;
pub mod message_index;
pub mod relterms_index;
pub mod schema;
pub mod timestamps;

pub use collections::{SqliteMessageCollection, SqliteSemanticRefCollection};
pub use indexes::{SqlitePropertyIndex, SqliteTermToSemanticRefIndex};
pub use message_index::SqliteMessageTextIndex;
pub use relterms_index::{SqliteRelatedTermsFuzzy, SqliteRelatedTermsIndex, SqliteTermAliases};
pub use schema::CONVERSATION_SCHEMA_VERSION;
pub use timestamps::SqliteTimestampIndex;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use memoir_core::{
    ConversationSettings, ConversationThreads, MessageCollection, MessageTextIndex,
    PropertyToSemanticRefIndex, RelatedTermsIndex, SemanticRefCollection, StorageProvider,
    TermToSemanticRefIndex, TimestampToTextRangeIndex,
};
use memoir_embed::EmbeddingModel;

use crate::memory::MemoryConversationThreads;

/// Path sentinel for an in-memory database (tests).
pub const MEMORY_DB_PATH: &str = ":memory:";

/// The single metadata row of a conversation database.
#[derive(Debug, Clone)]
pub struct ConversationMetadata {
    pub name_tag: String,
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub extra: serde_json::Value,
}

pub struct SqliteStorageProvider {
    pool: SqlitePool,
    messages: Arc<SqliteMessageCollection>,
    semantic_refs: Arc<SqliteSemanticRefCollection>,
    semantic_ref_index: Arc<SqliteTermToSemanticRefIndex>,
    property_index: Arc<SqlitePropertyIndex>,
    timestamp_index: Arc<SqliteTimestampIndex>,
    message_text_index: Arc<SqliteMessageTextIndex>,
    related_terms_index: Arc<SqliteRelatedTermsIndex>,
    // Threads are transient; the schema has no table for them.
    threads: Arc<MemoryConversationThreads>,
}

impl SqliteStorageProvider {
    /// Open (creating if missing) the database at `path`, initialize the
    /// schema, and rehydrate the in-process vector bases from persisted
    /// embedding blobs.
    pub async fn open(
        path: impl AsRef<Path>,
        name_tag: &str,
        model: Arc<dyn EmbeddingModel>,
        settings: &ConversationSettings,
    ) -> Result<Self> {
        let path = path.as_ref();
        let options = if path.to_str() == Some(MEMORY_DB_PATH) {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        }
        .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        schema::init_db_schema(&pool).await?;
        Self::ensure_metadata(&pool, name_tag).await?;

        let provider = Self {
            messages: Arc::new(SqliteMessageCollection::new(pool.clone())),
            semantic_refs: Arc::new(SqliteSemanticRefCollection::new(pool.clone())),
            semantic_ref_index: Arc::new(SqliteTermToSemanticRefIndex::new(pool.clone())),
            property_index: Arc::new(SqlitePropertyIndex::new(pool.clone())),
            timestamp_index: Arc::new(SqliteTimestampIndex::new(pool.clone())),
            message_text_index: Arc::new(SqliteMessageTextIndex::new(
                pool.clone(),
                model.clone(),
                settings.message_text_index.clone(),
            )),
            related_terms_index: Arc::new(SqliteRelatedTermsIndex::new(
                pool.clone(),
                model.clone(),
                settings.related_term_index.clone(),
            )),
            threads: Arc::new(MemoryConversationThreads::new(
                model,
                settings.thread_index.clone(),
            )),
            pool,
        };
        provider.message_text_index.rehydrate().await?;
        provider.related_terms_index.fuzzy_impl().rehydrate().await?;
        info!(path = %path.display(), "opened conversation database");
        Ok(provider)
    }

    async fn ensure_metadata(pool: &SqlitePool, name_tag: &str) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ConversationMetadata")
            .fetch_one(pool)
            .await?;
        if count == 0 {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"INSERT INTO ConversationMetadata
                   (name_tag, schema_version, created_at, updated_at, tags, extra)
                   VALUES (?, ?, ?, ?, '[]', '{}')"#,
            )
            .bind(name_tag)
            .bind(CONVERSATION_SCHEMA_VERSION)
            .bind(&now)
            .bind(&now)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub async fn metadata(&self) -> Result<ConversationMetadata> {
        let row = sqlx::query(
            "SELECT name_tag, schema_version, created_at, updated_at, tags, extra FROM ConversationMetadata LIMIT 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ConversationMetadata {
            name_tag: row.get("name_tag"),
            schema_version: row.get("schema_version"),
            created_at: DateTime::parse_from_rfc3339(row.get("created_at"))?.with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(row.get("updated_at"))?.with_timezone(&Utc),
            tags: serde_json::from_str(row.get("tags"))?,
            extra: serde_json::from_str(row.get("extra"))?,
        })
    }

    /// Stamp the metadata row after a write burst.
    pub async fn touch_updated_at(&self) -> Result<()> {
        sqlx::query("UPDATE ConversationMetadata SET updated_at = ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_tags(&self, tags: &[String]) -> Result<()> {
        sqlx::query("UPDATE ConversationMetadata SET tags = ?, updated_at = ?")
            .bind(serde_json::to_string(tags)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for SqliteStorageProvider {
    async fn get_message_collection(&self) -> Result<Arc<dyn MessageCollection>> {
        Ok(self.messages.clone())
    }

    async fn get_semantic_ref_collection(&self) -> Result<Arc<dyn SemanticRefCollection>> {
        Ok(self.semantic_refs.clone())
    }

    async fn get_semantic_ref_index(&self) -> Result<Arc<dyn TermToSemanticRefIndex>> {
        Ok(self.semantic_ref_index.clone())
    }

    async fn get_property_index(&self) -> Result<Arc<dyn PropertyToSemanticRefIndex>> {
        Ok(self.property_index.clone())
    }

    async fn get_timestamp_index(&self) -> Result<Arc<dyn TimestampToTextRangeIndex>> {
        Ok(self.timestamp_index.clone())
    }

    async fn get_message_text_index(&self) -> Result<Arc<dyn MessageTextIndex>> {
        Ok(self.message_text_index.clone())
    }

    async fn get_related_terms_index(&self) -> Result<Arc<dyn RelatedTermsIndex>> {
        Ok(self.related_terms_index.clone())
    }

    async fn get_conversation_threads(&self) -> Result<Arc<dyn ConversationThreads>> {
        Ok(self.threads.clone())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
