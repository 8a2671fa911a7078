//! # Memoir Core
//!
//! Shared data model and storage contracts for the Memoir conversation
//! memory engine: messages, semantic references, terms, knowledge payloads,
//! and the async trait contracts implemented by the storage backends.

pub mod config;
pub mod error;
pub mod interfaces;
pub mod knowledge;
pub mod message;
pub mod normalize;
pub mod properties;
pub mod types;

pub use config::{
    ConversationSettings, RelatedTermIndexSettings, SemanticRefIndexSettings,
    TextEmbeddingIndexSettings,
};
pub use error::{MemoirError, MemoirResult};
pub use interfaces::{
    ConversationThreads, KnowledgeExtractor, KnowledgeValidator, MessageCollection,
    MessageTextIndex, PropertyToSemanticRefIndex, RelatedTermsFuzzyIndex, RelatedTermsIndex,
    SemanticRefCollection, StorageProvider, TermToRelatedTerms, TermToSemanticRefIndex,
    TimestampToTextRangeIndex,
};
pub use knowledge::{
    Action, ActionParam, ConcreteEntity, Facet, FacetValue, Knowledge, KnowledgeResponse,
    NamedParam, Quantity, Tag, Topic, VerbTense, NONE_ENTITY,
};
pub use message::{ConversationMessage, MessageMeta};
pub use normalize::normalize_term;
pub use types::{
    Conversation, DateRange, KnowledgeKind, MessageOrdinal, ScoredMessageOrdinal,
    ScoredSemanticRefOrdinal, ScoredTextLocation, ScoredThreadOrdinal, SemanticRef,
    SemanticRefOrdinal, Term, TextLocation, TextRange, Thread, TimestampedTextRange,
};
