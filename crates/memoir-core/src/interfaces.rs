//! Async contracts implemented by the storage backends.
//!
//! Both backends (in-memory and SQLite) expose identical observable
//! semantics through these traits. Indexes reference collections only by
//! integer ordinal, never by pointer; the storage provider owns all of
//! them. Writers for a single conversation must be externally serialized;
//! readers against a frozen conversation may run concurrently.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::knowledge::Knowledge;
use crate::message::ConversationMessage;
use crate::types::{
    DateRange, KnowledgeKind, MessageOrdinal, ScoredMessageOrdinal, ScoredSemanticRefOrdinal,
    ScoredTextLocation, ScoredThreadOrdinal, SemanticRef, SemanticRefOrdinal, Term, Thread,
    TimestampedTextRange,
};

/// Ordered, append-only store of messages keyed by dense ordinal.
#[async_trait]
pub trait MessageCollection: Send + Sync {
    async fn size(&self) -> Result<usize>;

    /// Appends one message; returns its ordinal (the pre-append size).
    async fn append(&self, message: ConversationMessage) -> Result<MessageOrdinal>;

    async fn extend(&self, messages: Vec<ConversationMessage>) -> Result<()>;

    /// Fetch by ordinal. A missing ordinal is an integrity error.
    async fn get(&self, ordinal: MessageOrdinal) -> Result<ConversationMessage>;

    async fn get_slice(&self, start: usize, end: usize) -> Result<Vec<ConversationMessage>>;

    async fn get_multiple(&self, ordinals: &[MessageOrdinal]) -> Result<Vec<ConversationMessage>>;

    /// Capability hint: true when appends survive process exit.
    fn is_persistent(&self) -> bool;
}

/// Ordered, append-only store of semantic references.
#[async_trait]
pub trait SemanticRefCollection: Send + Sync {
    async fn size(&self) -> Result<usize>;

    async fn append(&self, semantic_ref: SemanticRef) -> Result<SemanticRefOrdinal>;

    async fn extend(&self, semantic_refs: Vec<SemanticRef>) -> Result<()>;

    /// Fetch by ordinal. A missing ordinal is an integrity error.
    async fn get(&self, ordinal: SemanticRefOrdinal) -> Result<SemanticRef>;

    async fn get_slice(&self, start: usize, end: usize) -> Result<Vec<SemanticRef>>;

    async fn get_multiple(&self, ordinals: &[SemanticRefOrdinal]) -> Result<Vec<SemanticRef>>;

    fn is_persistent(&self) -> bool;
}

/// Primary index: normalized term -> scored semantic-ref ordinals.
///
/// Lookups are case- and whitespace-insensitive; a `(term, semref)` pair is
/// stored at most once.
#[async_trait]
pub trait TermToSemanticRefIndex: Send + Sync {
    async fn size(&self) -> Result<usize>;

    async fn get_terms(&self) -> Result<Vec<String>>;

    /// Adds the pair; the normalized form of the term is returned. The
    /// default score is 1.0.
    async fn add_term(
        &self,
        term: &str,
        semantic_ref: ScoredSemanticRefOrdinal,
    ) -> Result<String>;

    async fn remove_term(&self, term: &str, semantic_ref: SemanticRefOrdinal) -> Result<()>;

    async fn lookup_term(&self, term: &str) -> Result<Vec<ScoredSemanticRefOrdinal>>;

    async fn clear(&self) -> Result<()>;
}

/// Lookup by (property name, value), keyed as `prop.{name}@@{value}`,
/// lowercased.
#[async_trait]
pub trait PropertyToSemanticRefIndex: Send + Sync {
    async fn size(&self) -> Result<usize>;

    async fn get_values(&self) -> Result<Vec<String>>;

    async fn add_property(
        &self,
        property_name: &str,
        value: &str,
        semantic_ref: ScoredSemanticRefOrdinal,
    ) -> Result<()>;

    async fn lookup_property(
        &self,
        property_name: &str,
        value: &str,
    ) -> Result<Vec<ScoredSemanticRefOrdinal>>;

    async fn remove_property(
        &self,
        property_name: &str,
        semantic_ref: SemanticRefOrdinal,
    ) -> Result<()>;

    async fn remove_all_for_semantic_ref(&self, semantic_ref: SemanticRefOrdinal) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Range queries over message timestamps. Start-inclusive, end-exclusive;
/// an absent end is a point query matching the start exactly. Results
/// ascend by timestamp.
#[async_trait]
pub trait TimestampToTextRangeIndex: Send + Sync {
    async fn size(&self) -> Result<usize>;

    /// Returns false when the timestamp is empty.
    async fn add_timestamp(&self, message_ordinal: MessageOrdinal, timestamp: &str)
        -> Result<bool>;

    async fn add_timestamps(&self, entries: &[(MessageOrdinal, String)]) -> Result<()>;

    async fn lookup_range(&self, date_range: &DateRange) -> Result<Vec<TimestampedTextRange>>;
}

/// Deterministic synonym map: term -> related terms.
#[async_trait]
pub trait TermToRelatedTerms: Send + Sync {
    async fn size(&self) -> Result<usize>;

    async fn add_related_term(&self, text: &str, related: Vec<Term>) -> Result<()>;

    async fn lookup_term(&self, text: &str) -> Result<Option<Vec<Term>>>;

    async fn remove_term(&self, text: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Embedding-backed near-neighbor lookup over all terms ever added.
/// An exact self-match (score ~1.0 on identical text) is filtered out.
#[async_trait]
pub trait RelatedTermsFuzzyIndex: Send + Sync {
    async fn size(&self) -> Result<usize>;

    async fn add_terms(&self, terms: &[String]) -> Result<()>;

    async fn lookup_term(
        &self,
        text: &str,
        max_hits: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<Term>>;

    async fn lookup_terms(
        &self,
        texts: &[String],
        max_hits: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<Vec<Term>>>;
}

/// Composite related-terms index: an alias map plus a fuzzy index.
pub trait RelatedTermsIndex: Send + Sync {
    fn aliases(&self) -> Arc<dyn TermToRelatedTerms>;

    fn fuzzy(&self) -> Arc<dyn RelatedTermsFuzzyIndex>;
}

/// Per-chunk message text embeddings for message-level semantic retrieval.
#[async_trait]
pub trait MessageTextIndex: Send + Sync {
    async fn size(&self) -> Result<usize>;

    /// Embeds every chunk of the given messages (batched) and appends.
    /// `start_message_ordinal` is the ordinal of the first message given.
    async fn add_messages_starting_at(
        &self,
        start_message_ordinal: MessageOrdinal,
        messages: &[ConversationMessage],
    ) -> Result<()>;

    async fn lookup_text(
        &self,
        text: &str,
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredTextLocation>>;

    /// Chunk scores aggregate per message by max, re-sorted descending.
    async fn lookup_messages(
        &self,
        text: &str,
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredMessageOrdinal>>;

    async fn lookup_messages_in_subset(
        &self,
        text: &str,
        ordinals: &[MessageOrdinal],
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredMessageOrdinal>>;

    async fn lookup_by_embedding(
        &self,
        embedding: &[f32],
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredMessageOrdinal>>;

    async fn lookup_in_subset_by_embedding(
        &self,
        embedding: &[f32],
        ordinals: &[MessageOrdinal],
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredMessageOrdinal>>;

    /// Embed a query with the same model the index was built with.
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>>;
}

/// Sets of text ranges addressable by a natural-language description.
#[async_trait]
pub trait ConversationThreads: Send + Sync {
    async fn size(&self) -> Result<usize>;

    async fn threads(&self) -> Result<Vec<Thread>>;

    async fn add_thread(&self, thread: Thread) -> Result<()>;

    async fn lookup_thread(
        &self,
        description: &str,
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredThreadOrdinal>>;
}

/// Facade producing every collection and index of one conversation.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn get_message_collection(&self) -> Result<Arc<dyn MessageCollection>>;

    async fn get_semantic_ref_collection(&self) -> Result<Arc<dyn SemanticRefCollection>>;

    async fn get_semantic_ref_index(&self) -> Result<Arc<dyn TermToSemanticRefIndex>>;

    async fn get_property_index(&self) -> Result<Arc<dyn PropertyToSemanticRefIndex>>;

    async fn get_timestamp_index(&self) -> Result<Arc<dyn TimestampToTextRangeIndex>>;

    async fn get_message_text_index(&self) -> Result<Arc<dyn MessageTextIndex>>;

    async fn get_related_terms_index(&self) -> Result<Arc<dyn RelatedTermsIndex>>;

    async fn get_conversation_threads(&self) -> Result<Arc<dyn ConversationThreads>>;

    async fn close(&self) -> Result<()>;
}

/// Veto hook applied to individual pieces of metadata-derived knowledge
/// before they are indexed.
pub type KnowledgeValidator = Arc<dyn Fn(KnowledgeKind, &Knowledge) -> bool + Send + Sync>;

/// Re-exported for implementors of [`KnowledgeExtractor`].
pub use crate::knowledge::KnowledgeExtractor;
