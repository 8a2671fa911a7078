//! Helpers for building search and property terms programmatically.

use anyhow::Result;

use memoir_core::{
    properties, ScoredSemanticRefOrdinal, SemanticRef, SemanticRefCollection, Term,
};

use crate::algebra::{
    BooleanOp, PropertyNameTerm, PropertySearchTerm, SearchTerm, SearchTermGroup,
    SearchTermGroupEntry,
};

/// Create a search term with an optional weight; `exact_match` pins the
/// term to exact matching.
pub fn create_search_term(text: &str, weight: Option<f32>, exact_match: bool) -> SearchTerm {
    SearchTerm {
        term: Term {
            text: text.to_string(),
            weight,
        },
        related_terms: exact_match.then(Vec::new),
    }
}

/// Create a property search term; well-known names key the property
/// index directly, anything else searches as a facet name.
pub fn create_property_search_term(
    name: &str,
    value: &str,
    exact_match_value: bool,
) -> PropertySearchTerm {
    let property_name = if properties::is_known_property(name) {
        PropertyNameTerm::Known(name.to_string())
    } else {
        PropertyNameTerm::Facet(create_search_term(name, None, false))
    };
    PropertySearchTerm {
        property_name,
        property_value: create_search_term(value, None, exact_match_value),
    }
}

pub fn create_and_term_group(terms: Vec<SearchTermGroupEntry>) -> SearchTermGroup {
    SearchTermGroup {
        boolean_op: BooleanOp::And,
        terms,
    }
}

pub fn create_or_term_group(terms: Vec<SearchTermGroupEntry>) -> SearchTermGroup {
    SearchTermGroup {
        boolean_op: BooleanOp::Or,
        terms,
    }
}

pub fn create_or_max_term_group(terms: Vec<SearchTermGroupEntry>) -> SearchTermGroup {
    SearchTermGroup {
        boolean_op: BooleanOp::OrMax,
        terms,
    }
}

/// Parse term strings into search terms. Related terms can ride along
/// separated by `;`: `"novel;book;bestseller"` searches `novel` with
/// `book` and `bestseller` as related terms.
pub fn create_search_terms(terms: &[&str]) -> Vec<SearchTerm> {
    terms
        .iter()
        .filter_map(|text| parse_search_term(text))
        .collect()
}

fn parse_search_term(text: &str) -> Option<SearchTerm> {
    let mut parts = split_term_values(text, ';').into_iter();
    let primary = parts.next()?;
    let related: Vec<Term> = parts.map(Term::new).collect();
    Some(SearchTerm {
        term: Term::new(primary),
        related_terms: (!related.is_empty()).then_some(related),
    })
}

/// Property search terms from (name, value) pairs; a `,`-separated value
/// searches each sub-value separately.
pub fn create_property_search_terms(
    name_values: &[(&str, &str)],
) -> Vec<PropertySearchTerm> {
    let mut terms = Vec::new();
    for (name, value) in name_values {
        for sub_value in split_term_values(value, ',') {
            terms.push(create_property_search_term(name, &sub_value, false));
        }
    }
    terms
}

/// An or_max group matching any of the given topics.
pub fn create_topic_search_term_group(topics: &[&str], exact_match: bool) -> SearchTermGroup {
    create_or_max_term_group(
        topics
            .iter()
            .map(|topic| {
                SearchTermGroupEntry::Property(create_property_search_term(
                    properties::TOPIC,
                    topic,
                    exact_match,
                ))
            })
            .collect(),
    )
}

/// An or_max group matching an entity by name, type and facets.
pub fn create_entity_search_term_group(
    name: Option<&str>,
    entity_type: Option<&str>,
    facet_name: Option<&str>,
    facet_value: Option<&str>,
    exact_match: bool,
) -> SearchTermGroup {
    let mut terms = Vec::new();
    for (property, value) in [
        (properties::ENTITY_NAME, name),
        (properties::ENTITY_TYPE, entity_type),
        (properties::FACET_NAME, facet_name),
        (properties::FACET_VALUE, facet_value),
    ] {
        if let Some(value) = value {
            terms.push(SearchTermGroupEntry::Property(create_property_search_term(
                property, value, exact_match,
            )));
        }
    }
    create_or_max_term_group(terms)
}

/// An or_max group matching any of the given tags, exactly by default.
pub fn create_tag_search_term_group(tags: &[&str], exact_match: bool) -> SearchTermGroup {
    create_or_max_term_group(
        tags.iter()
            .map(|tag| {
                SearchTermGroupEntry::Property(create_property_search_term(
                    properties::TAG,
                    tag,
                    exact_match,
                ))
            })
            .collect(),
    )
}

fn split_term_values(text: &str, separator: char) -> Vec<String> {
    text.split(separator)
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

/// Fetch the semantic refs behind a list of scored ordinals, in order.
pub async fn get_semantic_refs_from_scored_ordinals(
    semantic_refs: &std::sync::Arc<dyn SemanticRefCollection>,
    scored_ordinals: &[ScoredSemanticRefOrdinal],
) -> Result<Vec<SemanticRef>> {
    let ordinals: Vec<usize> = scored_ordinals
        .iter()
        .map(|s| s.semantic_ref_ordinal)
        .collect();
    semantic_refs.get_multiple(&ordinals).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_related_terms_parse() {
        let terms = create_search_terms(&["novel;book;bestseller", "music"]);
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].term.text, "novel");
        let related = terms[0].related_terms.as_ref().unwrap();
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].text, "book");
        assert_eq!(terms[1].related_terms, None);
    }

    #[test]
    fn comma_separated_property_values_split() {
        let terms = create_property_search_terms(&[("type", "book, movie")]);
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[1].property_value.term.text, "movie");
    }

    #[test]
    fn unknown_property_names_search_as_facets() {
        let term = create_property_search_term("color", "blue", false);
        assert!(matches!(term.property_name, PropertyNameTerm::Facet(_)));
        let term = create_property_search_term("type", "book", false);
        assert!(matches!(term.property_name, PropertyNameTerm::Known(_)));
    }

    #[test]
    fn tag_groups_default_to_exact() {
        let group = create_tag_search_term_group(&["work"], true);
        match &group.terms[0] {
            SearchTermGroupEntry::Property(pst) => {
                assert_eq!(pst.property_value.related_terms, Some(vec![]));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }
}
