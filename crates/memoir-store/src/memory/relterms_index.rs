//! In-memory related-terms index: deterministic alias map plus an
//! embedding-backed fuzzy neighbor index over the primary-index terms.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use memoir_core::{
    normalize_term, RelatedTermIndexSettings, RelatedTermsFuzzyIndex, RelatedTermsIndex, Term,
    TermToRelatedTerms,
};
use memoir_embed::{EmbeddingModel, VectorBase};

/// Persistent snapshot of the alias map.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TermToRelatedTermsData {
    #[serde(default)]
    pub related_terms: Vec<TermsToRelatedTermsDataItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermsToRelatedTermsDataItem {
    pub term_text: String,
    pub related_terms: Vec<Term>,
}

/// Deterministic synonym map.
#[derive(Default)]
pub struct MemoryTermAliases {
    map: StdRwLock<BTreeMap<String, Vec<Term>>>,
}

impl MemoryTermAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_data(&self) -> TermToRelatedTermsData {
        let map = self.map.read().unwrap();
        TermToRelatedTermsData {
            related_terms: map
                .iter()
                .map(|(term, related)| TermsToRelatedTermsDataItem {
                    term_text: term.clone(),
                    related_terms: related.clone(),
                })
                .collect(),
        }
    }

    pub fn load_data(&self, data: TermToRelatedTermsData) {
        let mut map = self.map.write().unwrap();
        map.clear();
        drop(map);
        for item in data.related_terms {
            self.add_sync(&item.term_text, item.related_terms);
        }
    }

    fn add_sync(&self, text: &str, related: Vec<Term>) {
        let mut map = self.map.write().unwrap();
        let entry = map.entry(normalize_term(text)).or_default();
        for mut term in related {
            term.text = normalize_term(&term.text);
            if !entry.iter().any(|existing| existing.text == term.text) {
                entry.push(term);
            }
        }
    }
}

#[async_trait]
impl TermToRelatedTerms for MemoryTermAliases {
    async fn size(&self) -> Result<usize> {
        Ok(self.map.read().unwrap().len())
    }

    async fn add_related_term(&self, text: &str, related: Vec<Term>) -> Result<()> {
        self.add_sync(text, related);
        Ok(())
    }

    async fn lookup_term(&self, text: &str) -> Result<Option<Vec<Term>>> {
        let map = self.map.read().unwrap();
        Ok(map
            .get(&normalize_term(text))
            .filter(|related| !related.is_empty())
            .cloned())
    }

    async fn remove_term(&self, text: &str) -> Result<()> {
        self.map.write().unwrap().remove(&normalize_term(text));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.map.write().unwrap().clear();
        Ok(())
    }
}

/// Embedding-backed near-neighbor index over every term added.
pub struct MemoryRelatedTermsFuzzy {
    base: RwLock<VectorBase>,
    settings: RelatedTermIndexSettings,
}

impl MemoryRelatedTermsFuzzy {
    pub fn new(model: Arc<dyn EmbeddingModel>, settings: RelatedTermIndexSettings) -> Self {
        Self {
            base: RwLock::new(VectorBase::new(model)),
            settings,
        }
    }

    /// Snapshot as (texts, raw embedding bytes). `textItems` is always
    /// populated so the snapshot restores without re-embedding.
    pub async fn to_parts(&self) -> (Vec<String>, Vec<u8>) {
        let base = self.base.read().await;
        (base.texts().to_vec(), base.serialize_embeddings())
    }

    pub async fn load_parts(&self, texts: Vec<String>, bytes: &[u8]) -> Result<()> {
        self.base.write().await.restore(texts, bytes)
    }
}

#[async_trait]
impl RelatedTermsFuzzyIndex for MemoryRelatedTermsFuzzy {
    async fn size(&self) -> Result<usize> {
        Ok(self.base.read().await.len())
    }

    async fn add_terms(&self, terms: &[String]) -> Result<()> {
        let mut base = self.base.write().await;
        // Skip terms already indexed so a rebuild does not duplicate rows.
        let mut seen: std::collections::HashSet<String> =
            base.texts().iter().cloned().collect();
        let fresh: Vec<String> = terms
            .iter()
            .map(|t| normalize_term(t))
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();
        base.add_keys(&fresh).await
    }

    async fn lookup_term(
        &self,
        text: &str,
        max_hits: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<Term>> {
        let text = normalize_term(text);
        let base = self.base.read().await;
        let hits = base
            .fuzzy_lookup(
                &text,
                Some(max_hits.unwrap_or(self.settings.max_hits)),
                Some(min_score.unwrap_or(self.settings.min_score)),
            )
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let term_text = base.text(hit.ordinal)?;
                // The query term is never its own related term.
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

/// Composite alias + fuzzy index.
pub struct MemoryRelatedTermsIndex {
    aliases: Arc<MemoryTermAliases>,
    fuzzy: Arc<MemoryRelatedTermsFuzzy>,
}

impl MemoryRelatedTermsIndex {
    pub fn new(model: Arc<dyn EmbeddingModel>, settings: RelatedTermIndexSettings) -> Self {
        Self {
            aliases: Arc::new(MemoryTermAliases::new()),
            fuzzy: Arc::new(MemoryRelatedTermsFuzzy::new(model, settings)),
        }
    }

    pub fn alias_map(&self) -> &Arc<MemoryTermAliases> {
        &self.aliases
    }

    pub fn fuzzy_index(&self) -> &Arc<MemoryRelatedTermsFuzzy> {
        &self.fuzzy
    }
}

impl RelatedTermsIndex for MemoryRelatedTermsIndex {
    fn aliases(&self) -> Arc<dyn TermToRelatedTerms> {
        self.aliases.clone()
    }

    fn fuzzy(&self) -> Arc<dyn RelatedTermsFuzzyIndex> {
        self.fuzzy.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_embed::MockEmbeddingModel;

    fn fuzzy() -> MemoryRelatedTermsFuzzy {
        MemoryRelatedTermsFuzzy::new(
            Arc::new(MockEmbeddingModel::new(32)),
            RelatedTermIndexSettings {
                max_hits: 10,
                min_score: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn aliases_look_up_normalized() {
        let aliases = MemoryTermAliases::new();
        aliases
            .add_related_term("Say", vec![Term::new("Talk"), Term::new("speak")])
            .await
            .unwrap();
        let related = aliases.lookup_term("say").await.unwrap().unwrap();
        let texts: Vec<&str> = related.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["talk", "speak"]);
        assert!(aliases.lookup_term("shout").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fuzzy_filters_exact_self_match() {
        let index = fuzzy();
        index
            .add_terms(&["greeting".into(), "farewell".into(), "hello greeting".into()])
            .await
            .unwrap();
        let related = index.lookup_term("greeting", None, None).await.unwrap();
        assert!(related
            .iter()
            .all(|t| !(t.text == "greeting" && t.weight.unwrap_or(0.0) >= 0.999)));
        assert!(related.iter().any(|t| t.text == "hello greeting"));
    }

    #[tokio::test]
    async fn fuzzy_snapshot_round_trips() {
        let index = fuzzy();
        index
            .add_terms(&["alpha".into(), "beta".into()])
            .await
            .unwrap();
        let (texts, bytes) = index.to_parts().await;
        assert_eq!(texts.len(), 2);

        let restored = fuzzy();
        restored.load_parts(texts, &bytes).await.unwrap();
        assert_eq!(restored.size().await.unwrap(), 2);
        let related = restored.lookup_term("alpha", None, None).await.unwrap();
        assert!(related.iter().any(|t| t.text == "beta"));
    }

    #[tokio::test]
    async fn alias_snapshot_round_trips() {
        let aliases = MemoryTermAliases::new();
        aliases
            .add_related_term("send", vec![Term::new("mail")])
            .await
            .unwrap();
        let data = aliases.to_data();
        let restored = MemoryTermAliases::new();
        restored.load_data(data);
        assert!(restored.lookup_term("send").await.unwrap().is_some());
    }
}
