//! In-memory property index keyed by `prop.{name}@@{value}`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use memoir_core::{PropertyToSemanticRefIndex, ScoredSemanticRefOrdinal, SemanticRefOrdinal};

use crate::propkey::{make_property_term_text, property_name_from_key, split_property_term_text};

#[derive(Default)]
pub struct MemoryPropertyIndex {
    map: RwLock<BTreeMap<String, Vec<ScoredSemanticRefOrdinal>>>,
}

impl MemoryPropertyIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PropertyToSemanticRefIndex for MemoryPropertyIndex {
    async fn size(&self) -> Result<usize> {
        Ok(self.map.read().unwrap().len())
    }

    async fn get_values(&self) -> Result<Vec<String>> {
        Ok(self
            .map
            .read()
            .unwrap()
            .keys()
            .map(|key| split_property_term_text(key).1)
            .collect())
    }

    async fn add_property(
        &self,
        property_name: &str,
        value: &str,
        semantic_ref: ScoredSemanticRefOrdinal,
    ) -> Result<()> {
        let key = make_property_term_text(property_name, value);
        let mut map = self.map.write().unwrap();
        let entry = map.entry(key).or_default();
        if !entry
            .iter()
            .any(|r| r.semantic_ref_ordinal == semantic_ref.semantic_ref_ordinal)
        {
            entry.push(semantic_ref);
        }
        Ok(())
    }

    async fn lookup_property(
        &self,
        property_name: &str,
        value: &str,
    ) -> Result<Vec<ScoredSemanticRefOrdinal>> {
        let key = make_property_term_text(property_name, value);
        Ok(self
            .map
            .read()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_property(
        &self,
        property_name: &str,
        semantic_ref: SemanticRefOrdinal,
    ) -> Result<()> {
        let target = memoir_core::normalize_term(property_name);
        let mut map = self.map.write().unwrap();
        map.retain(|key, refs| {
            if property_name_from_key(key) == target {
                refs.retain(|r| r.semantic_ref_ordinal != semantic_ref);
            }
            !refs.is_empty()
        });
        Ok(())
    }

    async fn remove_all_for_semantic_ref(&self, semantic_ref: SemanticRefOrdinal) -> Result<()> {
        let mut map = self.map.write().unwrap();
        map.retain(|_, refs| {
            refs.retain(|r| r.semantic_ref_ordinal != semantic_ref);
            !refs.is_empty()
        });
        Ok(())
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
    async fn lookup_is_case_insensitive() {
        let index = MemoryPropertyIndex::new();
        index.add_property("type", "book", scored(3)).await.unwrap();
        let upper = index.lookup_property("Type", "Book").await.unwrap();
        let lower = index.lookup_property("type", "book").await.unwrap();
        assert_eq!(upper.len(), 1);
        assert_eq!(upper[0].semantic_ref_ordinal, 3);
        assert_eq!(upper.len(), lower.len());
        assert_eq!(upper[0].semantic_ref_ordinal, lower[0].semantic_ref_ordinal);
    }

    #[tokio::test]
    async fn remove_property_keeps_other_names() {
        let index = MemoryPropertyIndex::new();
        index.add_property("name", "alice", scored(1)).await.unwrap();
        index.add_property("type", "person", scored(1)).await.unwrap();
        index.remove_property("name", 1).await.unwrap();
        assert!(index.lookup_property("name", "alice").await.unwrap().is_empty());
        assert_eq!(
            index.lookup_property("type", "person").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn remove_all_for_semref_sweeps_every_key() {
        let index = MemoryPropertyIndex::new();
        index.add_property("name", "alice", scored(1)).await.unwrap();
        index.add_property("type", "person", scored(1)).await.unwrap();
        index.add_property("type", "person", scored(2)).await.unwrap();
        index.remove_all_for_semantic_ref(1).await.unwrap();
        assert!(index.lookup_property("name", "alice").await.unwrap().is_empty());
        let remaining = index.lookup_property("type", "person").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].semantic_ref_ordinal, 2);
    }
}
