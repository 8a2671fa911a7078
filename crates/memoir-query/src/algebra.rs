//! The search-term algebra: terms, property terms, and boolean groups.

use serde::{Deserialize, Serialize};

use memoir_core::{DateRange, KnowledgeKind, Term, TextRange};

/// Match-anything sentinel.
pub const WILDCARD: &str = "*";

/// Boolean combination applied to a group of terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanOp {
    And,
    Or,
    OrMax,
}

/// A term to search for, plus the related terms to search alongside it.
///
/// `related_terms = None` asks the compiler to resolve related terms from
/// the alias and fuzzy indexes; `related_terms = Some(vec![])` pins the
/// term to exact matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTerm {
    pub term: Term,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_terms: Option<Vec<Term>>,
}

impl SearchTerm {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            term: Term::new(text),
            related_terms: None,
        }
    }

    /// A term that must match exactly, with no related-term expansion.
    pub fn exact(text: impl Into<String>) -> Self {
        Self {
            term: Term::new(text),
            related_terms: Some(Vec::new()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.term.text == WILDCARD
    }
}

/// The name half of a property search term: a well-known property name,
/// or an arbitrary facet name searched as a term itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyNameTerm {
    Known(String),
    Facet(SearchTerm),
}

/// A structured (property name, value) search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySearchTerm {
    pub property_name: PropertyNameTerm,
    pub property_value: SearchTerm,
}

impl PropertySearchTerm {
    /// True when this term describes an action role, which implies
    /// message scoping.
    pub fn is_action_property(&self) -> bool {
        match &self.property_name {
            PropertyNameTerm::Known(name) => memoir_core::properties::is_action_property(name),
            PropertyNameTerm::Facet(_) => false,
        }
    }
}

/// One entry of a term group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchTermGroupEntry {
    Property(PropertySearchTerm),
    Group(SearchTermGroup),
    Term(SearchTerm),
}

/// A boolean group of search terms, property terms, and nested groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTermGroup {
    pub boolean_op: BooleanOp,
    #[serde(default)]
    pub terms: Vec<SearchTermGroupEntry>,
}

impl SearchTermGroup {
    pub fn new(boolean_op: BooleanOp) -> Self {
        Self {
            boolean_op,
            terms: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Constraints applied around the term matching itself.
#[derive(Debug, Clone, Default)]
pub struct WhenFilter {
    pub knowledge_kind: Option<KnowledgeKind>,
    pub date_range: Option<DateRange>,
    /// Explicit scope-defining terms; when absent, action terms in the
    /// select group imply scope.
    pub scope_defining_terms: Option<SearchTermGroup>,
    pub text_ranges_in_scope: Option<Vec<TextRange>>,
    pub tags: Option<Vec<String>>,
    pub thread_description: Option<String>,
}

impl WhenFilter {
    pub fn is_empty(&self) -> bool {
        self.knowledge_kind.is_none()
            && self.date_range.is_none()
            && self.scope_defining_terms.is_none()
            && self.text_ranges_in_scope.is_none()
            && self.tags.is_none()
            && self.thread_description.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_terms_suppress_resolution() {
        let term = SearchTerm::exact("book");
        assert_eq!(term.related_terms, Some(vec![]));
        let term = SearchTerm::new("book");
        assert_eq!(term.related_terms, None);
    }

    #[test]
    fn action_properties_are_detected() {
        let term = PropertySearchTerm {
            property_name: PropertyNameTerm::Known("subject".into()),
            property_value: SearchTerm::new("alice"),
        };
        assert!(term.is_action_property());
        let term = PropertySearchTerm {
            property_name: PropertyNameTerm::Known("name".into()),
            property_value: SearchTerm::new("alice"),
        };
        assert!(!term.is_action_property());
    }
}
