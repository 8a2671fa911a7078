//! Conversation-level settings.

use serde::{Deserialize, Serialize};

/// Settings for an embedding-backed text index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEmbeddingIndexSettings {
    /// Embedding dimension; all vectors in an index share it.
    pub embedding_dimension: usize,
    pub max_matches: usize,
    pub min_score: f32,
}

impl Default for TextEmbeddingIndexSettings {
    fn default() -> Self {
        Self {
            embedding_dimension: 384,
            max_matches: 25,
            min_score: 0.7,
        }
    }
}

/// Settings for the related-terms fuzzy index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedTermIndexSettings {
    pub max_hits: usize,
    pub min_score: f32,
}

impl Default for RelatedTermIndexSettings {
    fn default() -> Self {
        Self {
            max_hits: 10,
            min_score: 0.8,
        }
    }
}

/// Settings for building the semantic-ref index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticRefIndexSettings {
    /// Chunks extracted per knowledge-extractor call.
    pub batch_size: usize,
    /// When false, only metadata-derived knowledge is indexed.
    pub auto_extract_knowledge: bool,
}

impl Default for SemanticRefIndexSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            auto_extract_knowledge: true,
        }
    }
}

/// All per-conversation tuning knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationSettings {
    pub semantic_ref_index: SemanticRefIndexSettings,
    pub related_term_index: RelatedTermIndexSettings,
    pub message_text_index: TextEmbeddingIndexSettings,
    pub thread_index: RelatedTermIndexSettings,
}
