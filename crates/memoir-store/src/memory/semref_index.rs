//! In-memory primary index: normalized term -> scored semref ordinals.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use memoir_core::{
    normalize_term, ScoredSemanticRefOrdinal, SemanticRefOrdinal, TermToSemanticRefIndex,
};

/// Persistent snapshot of the index, camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermToSemanticRefIndexData {
    pub items: Vec<TermToSemanticRefIndexItemData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermToSemanticRefIndexItemData {
    pub term: String,
    pub semantic_ref_ordinals: Vec<ScoredSemanticRefOrdinal>,
}

#[derive(Default)]
pub struct MemoryTermToSemanticRefIndex {
    // BTreeMap keeps get_terms deterministic across runs.
    map: RwLock<BTreeMap<String, Vec<ScoredSemanticRefOrdinal>>>,
}

impl MemoryTermToSemanticRefIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_data(&self) -> TermToSemanticRefIndexData {
        let map = self.map.read().unwrap();
        TermToSemanticRefIndexData {
            items: map
                .iter()
                .map(|(term, refs)| TermToSemanticRefIndexItemData {
                    term: term.clone(),
                    semantic_ref_ordinals: refs.clone(),
                })
                .collect(),
        }
    }

    pub fn load_data(&self, data: TermToSemanticRefIndexData) {
        let mut map = self.map.write().unwrap();
        map.clear();
        for item in data.items {
            map.insert(normalize_term(&item.term), item.semantic_ref_ordinals);
        }
    }
}

#[async_trait]
impl TermToSemanticRefIndex for MemoryTermToSemanticRefIndex {
    async fn size(&self) -> Result<usize> {
        Ok(self.map.read().unwrap().len())
    }

    async fn get_terms(&self) -> Result<Vec<String>> {
        Ok(self.map.read().unwrap().keys().cloned().collect())
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
        let mut map = self.map.write().unwrap();
        let entry = map.entry(term.clone()).or_default();
        // A (term, semref) pair is stored at most once.
        if !entry
            .iter()
            .any(|r| r.semantic_ref_ordinal == semantic_ref.semantic_ref_ordinal)
        {
            entry.push(semantic_ref);
        }
        Ok(term)
    }

    async fn remove_term(&self, term: &str, semantic_ref: SemanticRefOrdinal) -> Result<()> {
        let term = normalize_term(term);
        let mut map = self.map.write().unwrap();
        if let Some(entry) = map.get_mut(&term) {
            entry.retain(|r| r.semantic_ref_ordinal != semantic_ref);
            if entry.is_empty() {
                map.remove(&term);
            }
        }
        Ok(())
    }

    async fn lookup_term(&self, term: &str) -> Result<Vec<ScoredSemanticRefOrdinal>> {
        Ok(self
            .map
            .read()
            .unwrap()
            .get(&normalize_term(term))
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self) -> Result<()> {
        self.map.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(ordinal: usize) -> ScoredSemanticRefOrdinal {
        ScoredSemanticRefOrdinal::new(ordinal, 1.0)
    }

    #[tokio::test]
    async fn lookup_is_case_and_whitespace_insensitive() {
        let index = MemoryTermToSemanticRefIndex::new();
        index.add_term("  Foo\tBAR  ", scored(7)).await.unwrap();
        for query in ["foo bar", "FOO BAR", " foo  bar "] {
            let hits = index.lookup_term(query).await.unwrap();
            assert_eq!(hits.len(), 1, "query {query:?}");
            assert_eq!(hits[0].semantic_ref_ordinal, 7);
            assert_eq!(hits[0].score, 1.0);
        }
    }

    #[tokio::test]
    async fn duplicate_pairs_collapse() {
        let index = MemoryTermToSemanticRefIndex::new();
        index.add_term("book", scored(1)).await.unwrap();
        index.add_term("Book", scored(1)).await.unwrap();
        index.add_term("book", scored(2)).await.unwrap();
        let hits = index.lookup_term("book").await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn remove_term_drops_only_that_pair() {
        let index = MemoryTermToSemanticRefIndex::new();
        index.add_term("book", scored(1)).await.unwrap();
        index.add_term("book", scored(2)).await.unwrap();
        index.remove_term("book", 1).await.unwrap();
        let hits = index.lookup_term("book").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].semantic_ref_ordinal, 2);
        index.remove_term("book", 2).await.unwrap();
        assert!(index.lookup_term("book").await.unwrap().is_empty());
        assert_eq!(index.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let index = MemoryTermToSemanticRefIndex::new();
        index.add_term("alice", scored(0)).await.unwrap();
        index.add_term("bob", scored(1)).await.unwrap();
        let data = index.to_data();

        let restored = MemoryTermToSemanticRefIndex::new();
        restored.load_data(data);
        assert_eq!(restored.get_terms().await.unwrap(), vec!["alice", "bob"]);
        assert_eq!(
            restored.lookup_term("ALICE").await.unwrap()[0].semantic_ref_ordinal,
            0
        );
    }

    #[tokio::test]
    async fn empty_term_is_ignored() {
        let index = MemoryTermToSemanticRefIndex::new();
        index.add_term("   ", scored(0)).await.unwrap();
        assert_eq!(index.size().await.unwrap(), 0);
    }
}
