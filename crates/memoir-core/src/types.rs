//! Core data types shared across all Memoir components

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interfaces::StorageProvider;
use crate::knowledge::Knowledge;

/// Dense ordinal of a message within its collection.
pub type MessageOrdinal = usize;

/// Dense ordinal of a semantic reference within its collection.
pub type SemanticRefOrdinal = usize;

/// Dense ordinal of a conversation thread.
pub type ThreadOrdinal = usize;

/// A position within the conversation text: message, chunk within the
/// message, character within the chunk. Ordered lexicographically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "camelCase")]
pub struct TextLocation {
    pub message_ordinal: MessageOrdinal,
    #[serde(default)]
    pub chunk_ordinal: usize,
    #[serde(default)]
    pub char_ordinal: usize,
}

impl TextLocation {
    pub fn new(message_ordinal: MessageOrdinal, chunk_ordinal: usize) -> Self {
        Self {
            message_ordinal,
            chunk_ordinal,
            char_ordinal: 0,
        }
    }
}

/// A text range. When `end` is absent the range denotes the single point
/// at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextRange {
    pub start: TextLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<TextLocation>,
}

impl TextRange {
    pub fn point(start: TextLocation) -> Self {
        Self { start, end: None }
    }

    /// Range anchoring knowledge extracted from one chunk of one message.
    pub fn from_message_chunk(message_ordinal: MessageOrdinal, chunk_ordinal: usize) -> Self {
        Self::point(TextLocation::new(message_ordinal, chunk_ordinal))
    }

    fn end_or_start(&self) -> TextLocation {
        self.end.unwrap_or(self.start)
    }

    /// `self` contains `other` iff `self.start <= other.start` and
    /// `other.end-or-start <= self.end-or-start`.
    pub fn contains(&self, other: &TextRange) -> bool {
        self.start <= other.start && other.end_or_start() <= self.end_or_start()
    }

    /// Message ordinals spanned by this range, inclusive on both sides.
    pub fn message_ordinals(&self) -> std::ops::RangeInclusive<MessageOrdinal> {
        self.start.message_ordinal..=self.end_or_start().message_ordinal
    }
}

impl PartialOrd for TextRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TextRange {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.start, self.end_or_start()).cmp(&(other.start, other.end_or_start()))
    }
}

/// A search token: normalized text plus an optional ranking weight.
/// Equality and hashing consider the text only; the weight is advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
}

impl Term {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            weight: None,
        }
    }

    pub fn with_weight(text: impl Into<String>, weight: f32) -> Self {
        Self {
            text: text.into(),
            weight: Some(weight),
        }
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Term {}

impl std::hash::Hash for Term {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

/// Tag distinguishing the knowledge payload variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeKind {
    Entity,
    Action,
    Topic,
    Tag,
}

impl std::fmt::Display for KnowledgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KnowledgeKind::Entity => write!(f, "entity"),
            KnowledgeKind::Action => write!(f, "action"),
            KnowledgeKind::Topic => write!(f, "topic"),
            KnowledgeKind::Tag => write!(f, "tag"),
        }
    }
}

/// A piece of extracted knowledge anchored to a text range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticRef {
    pub semantic_ref_ordinal: SemanticRefOrdinal,
    pub range: TextRange,
    #[serde(flatten)]
    pub knowledge: Knowledge,
}

impl SemanticRef {
    pub fn new(
        semantic_ref_ordinal: SemanticRefOrdinal,
        range: TextRange,
        knowledge: Knowledge,
    ) -> Self {
        Self {
            semantic_ref_ordinal,
            range,
            knowledge,
        }
    }

    pub fn knowledge_kind(&self) -> KnowledgeKind {
        self.knowledge.kind()
    }
}

/// A semantic-ref ordinal with its match score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredSemanticRefOrdinal {
    pub semantic_ref_ordinal: SemanticRefOrdinal,
    pub score: f32,
}

impl ScoredSemanticRefOrdinal {
    pub fn new(semantic_ref_ordinal: SemanticRefOrdinal, score: f32) -> Self {
        Self {
            semantic_ref_ordinal,
            score,
        }
    }
}

/// A message ordinal with its match score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredMessageOrdinal {
    pub message_ordinal: MessageOrdinal,
    pub score: f32,
}

/// A text location with its similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredTextLocation {
    pub text_location: TextLocation,
    pub score: f32,
}

/// A half-open datetime range. `end = None` denotes a point query that
/// matches timestamps exactly equal to `start`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }
}

/// Entry of the timestamp index: an ISO timestamp plus the message range
/// it stamps. Timestamps are RFC 3339 UTC strings, so lexicographic order
/// equals chronological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedTextRange {
    pub timestamp: String,
    pub range: TextRange,
}

/// A named set of text ranges within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub description: String,
    pub ranges: Vec<TextRange>,
}

/// A thread ordinal with its match score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredThreadOrdinal {
    pub thread_ordinal: ThreadOrdinal,
    pub score: f32,
}

/// A conversation: a name tag, tags, and the storage provider owning its
/// collections and indexes. All cross-references between collections and
/// indexes are integer ordinals; the provider is the single owner of the
/// underlying state.
#[derive(Clone)]
pub struct Conversation {
    pub name_tag: String,
    pub tags: Vec<String>,
    provider: Arc<dyn StorageProvider>,
}

impl Conversation {
    pub fn new(
        name_tag: impl Into<String>,
        tags: Vec<String>,
        provider: Arc<dyn StorageProvider>,
    ) -> Self {
        Self {
            name_tag: name_tag.into(),
            tags,
            provider,
        }
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("name_tag", &self.name_tag)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(m: usize, c: usize) -> TextLocation {
        TextLocation::new(m, c)
    }

    #[test]
    fn text_location_orders_lexicographically() {
        assert!(loc(0, 1) < loc(1, 0));
        assert!(loc(2, 0) < loc(2, 1));
        let mut a = loc(3, 1);
        a.char_ordinal = 4;
        let mut b = loc(3, 1);
        b.char_ordinal = 5;
        assert!(a < b);
    }

    #[test]
    fn point_range_contains_only_itself() {
        let range = TextRange::from_message_chunk(5, 0);
        assert!(range.contains(&TextRange::from_message_chunk(5, 0)));
        assert!(!range.contains(&TextRange::from_message_chunk(5, 1)));
        assert!(!range.contains(&TextRange::from_message_chunk(4, 0)));
    }

    #[test]
    fn span_range_contains_inner_points() {
        let outer = TextRange {
            start: loc(1, 0),
            end: Some(loc(3, 0)),
        };
        assert!(outer.contains(&TextRange::point(loc(1, 0))));
        assert!(outer.contains(&TextRange::point(loc(2, 4))));
        assert!(outer.contains(&TextRange::point(loc(3, 0))));
        assert!(!outer.contains(&TextRange::point(loc(3, 1))));
    }

    #[test]
    fn term_equality_ignores_weight() {
        assert_eq!(Term::new("book"), Term::with_weight("book", 0.5));
        assert_ne!(Term::new("book"), Term::new("novel"));
    }
}
