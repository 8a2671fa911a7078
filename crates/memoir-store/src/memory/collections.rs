//! Ordered, append-only in-memory collections.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use memoir_core::{
    ConversationMessage, MemoirError, MessageCollection, MessageOrdinal, SemanticRef,
    SemanticRefCollection, SemanticRefOrdinal,
};

fn get_cloned<T: Clone>(items: &[T], ordinal: usize, what: &str) -> Result<T> {
    items.get(ordinal).cloned().ok_or_else(|| {
        MemoirError::integrity(format!(
            "{what} ordinal {ordinal} out of bounds (size {})",
            items.len()
        ))
        .into()
    })
}

fn get_slice_cloned<T: Clone>(items: &[T], start: usize, end: usize) -> Vec<T> {
    let end = end.min(items.len());
    if start >= end {
        return Vec::new();
    }
    items[start..end].to_vec()
}

/// In-memory message store.
#[derive(Default)]
pub struct MemoryMessageCollection {
    items: RwLock<Vec<ConversationMessage>>,
}

impl MemoryMessageCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageCollection for MemoryMessageCollection {
    async fn size(&self) -> Result<usize> {
        Ok(self.items.read().unwrap().len())
    }

    async fn append(&self, message: ConversationMessage) -> Result<MessageOrdinal> {
        let mut items = self.items.write().unwrap();
        let ordinal = items.len();
        items.push(message);
        Ok(ordinal)
    }

    async fn extend(&self, messages: Vec<ConversationMessage>) -> Result<()> {
        self.items.write().unwrap().extend(messages);
        Ok(())
    }

    async fn get(&self, ordinal: MessageOrdinal) -> Result<ConversationMessage> {
        get_cloned(&self.items.read().unwrap(), ordinal, "message")
    }

    async fn get_slice(&self, start: usize, end: usize) -> Result<Vec<ConversationMessage>> {
        Ok(get_slice_cloned(&self.items.read().unwrap(), start, end))
    }

    async fn get_multiple(
        &self,
        ordinals: &[MessageOrdinal],
    ) -> Result<Vec<ConversationMessage>> {
        let items = self.items.read().unwrap();
        ordinals
            .iter()
            .map(|&ordinal| get_cloned(&items, ordinal, "message"))
            .collect()
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// In-memory semantic-ref store.
#[derive(Default)]
pub struct MemorySemanticRefCollection {
    items: RwLock<Vec<SemanticRef>>,
}

impl MemorySemanticRefCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SemanticRefCollection for MemorySemanticRefCollection {
    async fn size(&self) -> Result<usize> {
        Ok(self.items.read().unwrap().len())
    }

    async fn append(&self, semantic_ref: SemanticRef) -> Result<SemanticRefOrdinal> {
        let mut items = self.items.write().unwrap();
        let ordinal = items.len();
        items.push(semantic_ref);
        Ok(ordinal)
    }

    async fn extend(&self, semantic_refs: Vec<SemanticRef>) -> Result<()> {
        self.items.write().unwrap().extend(semantic_refs);
        Ok(())
    }

    async fn get(&self, ordinal: SemanticRefOrdinal) -> Result<SemanticRef> {
        get_cloned(&self.items.read().unwrap(), ordinal, "semantic ref")
    }

    async fn get_slice(&self, start: usize, end: usize) -> Result<Vec<SemanticRef>> {
        Ok(get_slice_cloned(&self.items.read().unwrap(), start, end))
    }

    async fn get_multiple(&self, ordinals: &[SemanticRefOrdinal]) -> Result<Vec<SemanticRef>> {
        let items = self.items.read().unwrap();
        ordinals
            .iter()
            .map(|&ordinal| get_cloned(&items, ordinal, "semantic ref"))
            .collect()
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::{ConversationMessage, MessageMeta};

    fn message(text: &str) -> ConversationMessage {
        ConversationMessage::new(vec![text.to_string()], MessageMeta::None)
    }

    #[tokio::test]
    async fn append_assigns_dense_ordinals() {
        let collection = MemoryMessageCollection::new();
        assert_eq!(collection.append(message("a")).await.unwrap(), 0);
        assert_eq!(collection.append(message("b")).await.unwrap(), 1);
        assert_eq!(collection.size().await.unwrap(), 2);
        assert_eq!(collection.get(1).await.unwrap().text_chunks, vec!["b"]);
    }

    #[tokio::test]
    async fn missing_ordinal_is_an_error() {
        let collection = MemoryMessageCollection::new();
        collection.append(message("only")).await.unwrap();
        assert!(collection.get(1).await.is_err());
        assert!(collection.get_multiple(&[0, 1]).await.is_err());
    }

    #[tokio::test]
    async fn slice_clamps_to_size() {
        let collection = MemoryMessageCollection::new();
        collection
            .extend(vec![message("a"), message("b"), message("c")])
            .await
            .unwrap();
        let slice = collection.get_slice(1, 10).await.unwrap();
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].text_chunks, vec!["b"]);
    }
}
