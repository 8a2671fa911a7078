//! In-memory storage backend. All state lives in process; nothing survives
//! exit. Fast path for tests and for conversations loaded from the JSON
//! file format.

pub mod collections;
pub mod message_index;
pub mod prop_index;
pub mod relterms_index;
pub mod semref_index;
pub mod threads;
pub mod timestamp_index;

pub use collections::{MemoryMessageCollection, MemorySemanticRefCollection};
pub use message_index::MemoryMessageTextIndex;
pub use prop_index::MemoryPropertyIndex;
pub use relterms_index::{MemoryRelatedTermsFuzzy, MemoryRelatedTermsIndex, MemoryTermAliases};
pub use semref_index::MemoryTermToSemanticRefIndex;
pub use threads::MemoryConversationThreads;
pub use timestamp_index::MemoryTimestampIndex;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use memoir_core::{
    ConversationSettings, ConversationThreads, MessageCollection, MessageTextIndex,
    PropertyToSemanticRefIndex, RelatedTermsIndex, SemanticRefCollection, StorageProvider,
    TermToSemanticRefIndex, TimestampToTextRangeIndex,
};
use memoir_embed::EmbeddingModel;

/// Storage provider backed entirely by process memory.
pub struct MemoryStorageProvider {
    messages: Arc<MemoryMessageCollection>,
    semantic_refs: Arc<MemorySemanticRefCollection>,
    semantic_ref_index: Arc<MemoryTermToSemanticRefIndex>,
    property_index: Arc<MemoryPropertyIndex>,
    timestamp_index: Arc<MemoryTimestampIndex>,
    message_text_index: Arc<MemoryMessageTextIndex>,
    related_terms_index: Arc<MemoryRelatedTermsIndex>,
    threads: Arc<MemoryConversationThreads>,
}

impl MemoryStorageProvider {
    pub fn new(model: Arc<dyn EmbeddingModel>, settings: &ConversationSettings) -> Self {
        Self {
            messages: Arc::new(MemoryMessageCollection::new()),
            semantic_refs: Arc::new(MemorySemanticRefCollection::new()),
            semantic_ref_index: Arc::new(MemoryTermToSemanticRefIndex::new()),
            property_index: Arc::new(MemoryPropertyIndex::new()),
            timestamp_index: Arc::new(MemoryTimestampIndex::new()),
            message_text_index: Arc::new(MemoryMessageTextIndex::new(
                model.clone(),
                settings.message_text_index.clone(),
            )),
            related_terms_index: Arc::new(MemoryRelatedTermsIndex::new(
                model.clone(),
                settings.related_term_index.clone(),
            )),
            threads: Arc::new(MemoryConversationThreads::new(
                model,
                settings.thread_index.clone(),
            )),
        }
    }

    /// Typed access for the serialization layer.
    pub fn parts(
        &self,
    ) -> (
        &Arc<MemoryMessageCollection>,
        &Arc<MemorySemanticRefCollection>,
        &Arc<MemoryTermToSemanticRefIndex>,
        &Arc<MemoryRelatedTermsIndex>,
        &Arc<MemoryMessageTextIndex>,
    ) {
        (
            &self.messages,
            &self.semantic_refs,
            &self.semantic_ref_index,
            &self.related_terms_index,
            &self.message_text_index,
        )
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
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
        Ok(())
    }
}
