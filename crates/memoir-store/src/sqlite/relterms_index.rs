//! SQLite-backed related-terms index: aliases in RelatedTermsAliases,
//! fuzzy term embeddings in RelatedTermsFuzzy with an in-process mirror.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::debug;

use memoir_core::{
    normalize_term, RelatedTermIndexSettings, RelatedTermsFuzzyIndex, RelatedTermsIndex, Term,
    TermToRelatedTerms,
};
use memoir_embed::{encode_embedding, EmbeddingModel, VectorBase};

pub struct SqliteTermAliases {
    pool: SqlitePool,
}

impl SqliteTermAliases {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TermToRelatedTerms for SqliteTermAliases {
    async fn size(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT term) FROM RelatedTermsAliases")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn add_related_term(&self, text: &str, related: Vec<Term>) -> Result<()> {
        let term = normalize_term(text);
        let mut tx = self.pool.begin().await?;
        for alias in &related {
            sqlx::query("INSERT OR IGNORE INTO RelatedTermsAliases (term, alias) VALUES (?, ?)")
                .bind(&term)
                .bind(normalize_term(&alias.text))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn lookup_term(&self, text: &str) -> Result<Option<Vec<Term>>> {
        let rows =
            sqlx::query("SELECT alias FROM RelatedTermsAliases WHERE term = ? ORDER BY alias")
                .bind(normalize_term(text))
                .fetch_all(&self.pool)
                .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.into_iter()
                .map(|row| Term::new(row.get::<String, _>("alias")))
                .collect(),
        ))
    }

    async fn remove_term(&self, text: &str) -> Result<()> {
        sqlx::query("DELETE FROM RelatedTermsAliases WHERE term = ?")
            .bind(normalize_term(text))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM RelatedTermsAliases")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

struct FuzzyMirror {
    base: VectorBase,
    indexed: HashSet<String>,
}

pub struct SqliteRelatedTermsFuzzy {
    pool: SqlitePool,
    model: Arc<dyn EmbeddingModel>,
    mirror: RwLock<FuzzyMirror>,
    settings: RelatedTermIndexSettings,
}

impl SqliteRelatedTermsFuzzy {
    pub fn new(
        pool: SqlitePool,
        model: Arc<dyn EmbeddingModel>,
        settings: RelatedTermIndexSettings,
    ) -> Self {
        Self {
            pool,
            model: model.clone(),
            mirror: RwLock::new(FuzzyMirror {
                base: VectorBase::new(model),
                indexed: HashSet::new(),
            }),
            settings,
        }
    }

    /// Stream persisted term embeddings back into the in-process vector
    /// base, in insertion order.
    pub async fn rehydrate(&self) -> Result<()> {
        let rows = sqlx::query("SELECT term, term_embedding FROM RelatedTermsFuzzy ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut mirror = self.mirror.write().await;
        mirror.base.clear();
        mirror.indexed.clear();
        for row in &rows {
            let term: String = row.get("term");
            let blob: Vec<u8> = row.get("term_embedding");
            mirror
                .base
                .push_embedding(&term, &memoir_embed::decode_embedding(&blob))?;
            mirror.indexed.insert(term);
        }
        debug!(terms = rows.len(), "rehydrated related-terms fuzzy index");
        Ok(())
    }
}

#[async_trait]
impl RelatedTermsFuzzyIndex for SqliteRelatedTermsFuzzy {
    async fn size(&self) -> Result<usize> {
        Ok(self.mirror.read().await.base.len())
    }

    async fn add_terms(&self, terms: &[String]) -> Result<()> {
        // Dedupe against what is already indexed; the table keys by term.
        let fresh: Vec<String> = {
            let mirror = self.mirror.read().await;
            let mut seen = HashSet::new();
            terms
                .iter()
                .map(|t| normalize_term(t))
                .filter(|t| !t.is_empty() && !mirror.indexed.contains(t) && seen.insert(t.clone()))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        let embeddings = self.model.embed_batch(&fresh).await?;

        let mut tx = self.pool.begin().await?;
        for (term, embedding) in fresh.iter().zip(&embeddings) {
            sqlx::query(
                "INSERT OR IGNORE INTO RelatedTermsFuzzy (term, term_embedding) VALUES (?, ?)",
            )
            .bind(term)
            .bind(encode_embedding(embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut mirror = self.mirror.write().await;
        for (term, embedding) in fresh.iter().zip(&embeddings) {
            mirror.base.push_embedding(term, embedding)?;
            mirror.indexed.insert(term.clone());
        }
        Ok(())
    }

    async fn lookup_term(
        &self,
        text: &str,
        max_hits: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<Term>> {
        let text = normalize_term(text);
        let embedding = self.model.embed(&text).await?;
        let mirror = self.mirror.read().await;
        let hits = mirror.base.nearest(
            &embedding,
            Some(max_hits.unwrap_or(self.settings.max_hits)),
            Some(min_score.unwrap_or(self.settings.min_score)),
        );
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let term_text = mirror.base.text(hit.ordinal)?;
                if term_text == text {
                    return None;
                }
                Some(Term::with_weight(term_text, hit.score))
            })
            .collect())
    }

    async fn lookup_terms(
        &self,
        texts: &[String],
        max_hits: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<Vec<Term>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.lookup_term(text, max_hits, min_score).await?);
        }
        Ok(results)
    }
}

pub struct SqliteRelatedTermsIndex {
    aliases: Arc<SqliteTermAliases>,
    fuzzy: Arc<SqliteRelatedTermsFuzzy>,
}

impl SqliteRelatedTermsIndex {
    pub fn new(
        pool: SqlitePool,
        model: Arc<dyn EmbeddingModel>,
        settings: RelatedTermIndexSettings,
    ) -> Self {
        Self {
            aliases: Arc::new(SqliteTermAliases::new(pool.clone())),
            fuzzy: Arc::new(SqliteRelatedTermsFuzzy::new(pool, model, settings)),
        }
    }

    pub fn fuzzy_impl(&self) -> &Arc<SqliteRelatedTermsFuzzy> {
        &self.fuzzy
    }
}

impl RelatedTermsIndex for SqliteRelatedTermsIndex {
    fn aliases(&self) -> Arc<dyn TermToRelatedTerms> {
        self.aliases.clone()
    }

    fn fuzzy(&self) -> Arc<dyn RelatedTermsFuzzyIndex> {
        self.fuzzy.clone()
    }
}
