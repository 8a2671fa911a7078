//! SQLite schema for one conversation per database file.

use anyhow::Result;
use sqlx::SqlitePool;

pub const CONVERSATION_SCHEMA_VERSION: &str = "0.1";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS ConversationMetadata (
        name_tag TEXT NOT NULL,
        schema_version TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        tags JSON NOT NULL,
        extra JSON NOT NULL
    )"#,
    // Chunks live inline as JSON or externally behind a URI, never both.
    r#"CREATE TABLE IF NOT EXISTS Messages (
        msg_id INTEGER PRIMARY KEY,
        chunks JSON NULL,
        chunk_uri TEXT NULL,
        start_timestamp TEXT NULL,
        tags JSON NULL,
        metadata JSON NULL,
        extra JSON NULL,
        CONSTRAINT chunks_xor_chunkuri CHECK (
            (chunks IS NOT NULL AND chunk_uri IS NULL) OR
            (chunks IS NULL AND chunk_uri IS NOT NULL)
        )
    )"#,
    r#"CREATE TABLE IF NOT EXISTS SemanticRefs (
        semref_id INTEGER PRIMARY KEY,
        range_json JSON NOT NULL,
        knowledge_type TEXT NOT NULL,
        knowledge_json JSON NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS SemanticRefIndex (
        term TEXT NOT NULL,
        semref_id INTEGER NOT NULL,
        FOREIGN KEY (semref_id) REFERENCES SemanticRefs(semref_id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS PropertyIndex (
        prop_name TEXT NOT NULL,
        value_str TEXT NOT NULL,
        score REAL NOT NULL DEFAULT 1.0,
        semref_id INTEGER NOT NULL,
        FOREIGN KEY (semref_id) REFERENCES SemanticRefs(semref_id) ON DELETE CASCADE
    )"#,
    // Embeddings are raw little-endian float32 bytes.
    r#"CREATE TABLE IF NOT EXISTS MessageTextIndex (
        msg_id INTEGER NOT NULL,
        chunk_ordinal INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        PRIMARY KEY (msg_id, chunk_ordinal),
        FOREIGN KEY (msg_id) REFERENCES Messages(msg_id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS RelatedTermsAliases (
        term TEXT NOT NULL,
        alias TEXT NOT NULL,
        PRIMARY KEY (term, alias)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS RelatedTermsFuzzy (
        term TEXT NOT NULL PRIMARY KEY,
        term_embedding BLOB NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_messages_start_timestamp ON Messages(start_timestamp)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_semantic_ref_index_pair ON SemanticRefIndex(term, semref_id)",
    "CREATE INDEX IF NOT EXISTS idx_semantic_ref_index_term ON SemanticRefIndex(term)",
    "CREATE INDEX IF NOT EXISTS idx_property_index_prop_name ON PropertyIndex(prop_name)",
    "CREATE INDEX IF NOT EXISTS idx_property_index_value_str ON PropertyIndex(value_str)",
    "CREATE INDEX IF NOT EXISTS idx_property_index_combined ON PropertyIndex(prop_name, value_str)",
    "CREATE INDEX IF NOT EXISTS idx_property_index_semref ON PropertyIndex(semref_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_text_index_message ON MessageTextIndex(msg_id, chunk_ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_related_aliases_term ON RelatedTermsAliases(term)",
    "CREATE INDEX IF NOT EXISTS idx_related_aliases_alias ON RelatedTermsAliases(alias)",
];

pub async fn init_db_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
