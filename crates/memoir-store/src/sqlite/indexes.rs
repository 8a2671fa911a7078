//! SQLite-backed primary and property indexes.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use memoir_core::{
    normalize_term, PropertyToSemanticRefIndex, ScoredSemanticRefOrdinal, SemanticRefOrdinal,
    TermToSemanticRefIndex,
};

pub struct SqliteTermToSemanticRefIndex {
    pool: SqlitePool,
}

impl SqliteTermToSemanticRefIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TermToSemanticRefIndex for SqliteTermToSemanticRefIndex {
    async fn size(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT term) FROM SemanticRefIndex")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn get_terms(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT term FROM SemanticRefIndex ORDER BY term")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("term")).collect())
    }

    async fn add_term(
        &self,
        term: &str,
        semantic_ref: ScoredSemanticRefOrdinal,
    ) -> Result<String> {
        let term = normalize_term(term);
        if term.is_empty() {
            return Ok(term);
        }
        // The unique (term, semref_id) index collapses duplicate pairs.
        sqlx::query("INSERT OR IGNORE INTO SemanticRefIndex (term, semref_id) VALUES (?, ?)")
            .bind(&term)
            .bind(semantic_ref.semantic_ref_ordinal as i64)
            .execute(&self.pool)
            .await?;
        Ok(term)
    }

    async fn remove_term(&self, term: &str, semantic_ref: SemanticRefOrdinal) -> Result<()> {
        sqlx::query("DELETE FROM SemanticRefIndex WHERE term = ? AND semref_id = ?")
            .bind(normalize_term(term))
            .bind(semantic_ref as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn lookup_term(&self, term: &str) -> Result<Vec<ScoredSemanticRefOrdinal>> {
        let rows = sqlx::query(
            "SELECT semref_id FROM SemanticRefIndex WHERE term = ? ORDER BY semref_id",
        )
        .bind(normalize_term(term))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ScoredSemanticRefOrdinal::new(row.get::<i64, _>("semref_id") as usize, 1.0))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM SemanticRefIndex")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct SqlitePropertyIndex {
    pool: SqlitePool,
}

impl SqlitePropertyIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PropertyToSemanticRefIndex for SqlitePropertyIndex {
    async fn size(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM (SELECT DISTINCT prop_name, value_str FROM PropertyIndex)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn get_values(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT value_str FROM PropertyIndex ORDER BY value_str")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("value_str")).collect())
    }

    async fn add_property(
        &self,
        property_name: &str,
        value: &str,
        semantic_ref: ScoredSemanticRefOrdinal,
    ) -> Result<()> {
        let name = normalize_term(property_name);
        let value = normalize_term(value);
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM PropertyIndex WHERE prop_name = ? AND value_str = ? AND semref_id = ? LIMIT 1",
        )
        .bind(&name)
        .bind(&value)
        .bind(semantic_ref.semantic_ref_ordinal as i64)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_some() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO PropertyIndex (prop_name, value_str, score, semref_id) VALUES (?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(&value)
        .bind(semantic_ref.score as f64)
        .bind(semantic_ref.semantic_ref_ordinal as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lookup_property(
        &self,
        property_name: &str,
        value: &str,
    ) -> Result<Vec<ScoredSemanticRefOrdinal>> {
        let rows = sqlx::query(
            r#"SELECT semref_id, score FROM PropertyIndex
               WHERE prop_name = ? AND value_str = ? ORDER BY semref_id"#,
        )
        .bind(normalize_term(property_name))
        .bind(normalize_term(value))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                ScoredSemanticRefOrdinal::new(
                    row.get::<i64, _>("semref_id") as usize,
                    row.get::<f64, _>("score") as f32,
                )
            })
            .collect())
    }

    async fn remove_property(
        &self,
        property_name: &str,
        semantic_ref: SemanticRefOrdinal,
    ) -> Result<()> {
        sqlx::query("DELETE FROM PropertyIndex WHERE prop_name = ? AND semref_id = ?")
            .bind(normalize_term(property_name))
            .bind(semantic_ref as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_all_for_semantic_ref(&self, semantic_ref: SemanticRefOrdinal) -> Result<()> {
        sqlx::query("DELETE FROM PropertyIndex WHERE semref_id = ?")
            .bind(semantic_ref as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM PropertyIndex")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
