//! Compiles search-term groups into the operator tree: term
//! normalization, scope selection, knowledge-type filtering, and
//! related-term resolution with deduplication.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use memoir_core::{
    normalize_term, properties, Conversation, ConversationThreads, KnowledgeKind,
    MessageTextIndex, RelatedTermsFuzzyIndex, RelatedTermsIndex, StorageProvider, Term,
    TermToRelatedTerms, TextRange,
};

use crate::algebra::{
    BooleanOp, PropertyNameTerm, PropertySearchTerm, SearchTerm, SearchTermGroup,
    SearchTermGroupEntry, WhenFilter,
};
use crate::collections::TermSet;
use crate::ops::{
    KnowledgeExpr, MessageExpr, MessageMatchExpr, ScopeExpr, SemanticRefExpr,
    SemanticRefPredicate, TextRangeSelector,
};
use crate::search::{SearchOptions, SemanticRefSearchResult};

pub const DEFAULT_ENTITY_TERM_MATCH_WEIGHT: f32 = 100.0;
pub const DEFAULT_TERM_MATCH_WEIGHT: f32 = 10.0;
pub const RELATED_IS_EXACT_THRESHOLD: f32 = 0.95;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compiles one query. Compilers are single-use: create a fresh one per
/// query.
pub struct QueryCompiler<'a> {
    conversation: &'a Conversation,
    pub entity_term_match_weight: f32,
    pub default_term_match_weight: f32,
    pub related_is_exact_threshold: f32,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(conversation: &'a Conversation) -> Self {
        Self {
            conversation,
            entity_term_match_weight: DEFAULT_ENTITY_TERM_MATCH_WEIGHT,
            default_term_match_weight: DEFAULT_TERM_MATCH_WEIGHT,
            related_is_exact_threshold: RELATED_IS_EXACT_THRESHOLD,
        }
    }

    /// Compile the knowledge half of a search: select, scope, filter,
    /// group-by-kind, top-N.
    pub async fn compile_knowledge_query(
        &self,
        mut group: SearchTermGroup,
        filter: Option<&WhenFilter>,
        options: &SearchOptions,
    ) -> Result<KnowledgeExpr> {
        // Exact matches on entity name or type count for more than plain
        // term matches.
        self.apply_entity_value_weights(&mut group);

        // Scope-defining term groups: explicit ones from the filter win;
        // otherwise action terms in the select group imply scope.
        let mut scope_groups: Vec<SearchTermGroup> = Vec::new();
        if let Some(scope_terms) = filter.and_then(|f| f.scope_defining_terms.clone()) {
            if !scope_terms.is_empty() {
                scope_groups.push(scope_terms);
            }
        } else if let Some(action_group) = action_terms_from_group(&group) {
            scope_groups.push(action_group);
        }
        let mut tag_group = filter
            .and_then(|f| f.tags.as_ref())
            .map(|tags| tag_search_term_group(tags));

        let resolver = self.related_terms_resolver().await?;
        self.prepare_and_resolve(&mut group, resolver.as_ref(), true, options.exact_match)
            .await?;
        for scope_group in &mut scope_groups {
            self.prepare_and_resolve(scope_group, resolver.as_ref(), false, options.exact_match)
                .await?;
        }
        if let Some(tag_group) = &mut tag_group {
            // Tag terms are exact; still normalize and weight them.
            self.prepare_and_resolve(tag_group, resolver.as_ref(), false, true)
                .await?;
        }

        let scope = self
            .compile_scope(filter, scope_groups, tag_group)
            .await?;
        let select = self.compile_group(&group, scope);

        let select = match filter.and_then(|f| f.knowledge_kind) {
            Some(kind) => SemanticRefExpr::Where {
                src: Box::new(select),
                predicates: vec![SemanticRefPredicate::KnowledgeKind(kind)],
            },
            None => select,
        };

        Ok(KnowledgeExpr::SelectTopNGroup {
            src: Box::new(KnowledgeExpr::GroupByKind { src: select }),
            max_matches: options.max_knowledge_matches,
        })
    }

    /// Compile the message half: project knowledge matches to messages,
    /// re-rank by similarity when possible, and apply budgets.
    pub async fn compile_message_query(
        &self,
        knowledge: std::collections::BTreeMap<KnowledgeKind, SemanticRefSearchResult>,
        options: &SearchOptions,
        raw_query_text: Option<&str>,
    ) -> Result<MessageExpr> {
        let mut expr = MessageExpr::FromKnowledge { results: knowledge };

        expr = match self.compile_message_re_rank(raw_query_text, options).await {
            Some((embedding, max_matches, threshold_score)) => MessageExpr::RankBySimilarity {
                src: Box::new(expr),
                embedding,
                max_matches,
                threshold_score,
            },
            None => match options.max_message_matches {
                Some(max_matches) if max_matches > 0 => MessageExpr::SelectTopN {
                    src: Box::new(expr),
                    max_matches,
                },
                _ => MessageExpr::NoOp {
                    src: Box::new(expr),
                },
            },
        };

        if let Some(max_chars) = options.max_chars_in_budget {
            if max_chars > 0 {
                expr = MessageExpr::WithinCharBudget {
                    src: Box::new(expr),
                    max_chars,
                };
            }
        }
        Ok(expr)
    }

    async fn compile_message_re_rank(
        &self,
        raw_query_text: Option<&str>,
        options: &SearchOptions,
    ) -> Option<(Vec<f32>, Option<usize>, Option<f32>)> {
        let raw_query_text = raw_query_text?;
        let index: Arc<dyn MessageTextIndex> = self
            .conversation
            .provider()
            .get_message_text_index()
            .await
            .ok()?;
        if index.size().await.ok()? == 0 {
            return None;
        }
        match index.generate_embedding(raw_query_text).await {
            Ok(embedding) => Some((
                embedding,
                options.max_message_matches,
                options.threshold_score,
            )),
            Err(e) => {
                // Embedding the query is best-effort; ranking falls back
                // to top-N on knowledge scores.
                warn!(error = %e, "query embedding failed; rank step skipped");
                None
            }
        }
    }

    async fn related_terms_resolver(&self) -> Result<Option<Arc<dyn RelatedTermsIndex>>> {
        Ok(self
            .conversation
            .provider()
            .get_related_terms_index()
            .await
            .ok())
    }

    /// Default name/type property values to the entity match weight
    /// before general weight defaulting runs.
    fn apply_entity_value_weights(&self, group: &mut SearchTermGroup) {
        for entry in &mut group.terms {
            match entry {
                SearchTermGroupEntry::Property(pst) => {
                    if let PropertyNameTerm::Known(name) = &pst.property_name {
                        if (name == properties::ENTITY_NAME || name == properties::ENTITY_TYPE)
                            && pst.property_value.term.weight.is_none()
                        {
                            pst.property_value.term.weight =
                                Some(self.entity_term_match_weight);
                        }
                    }
                }
                SearchTermGroupEntry::Group(nested) => self.apply_entity_value_weights(nested),
                SearchTermGroupEntry::Term(_) => {}
            }
        }
    }

    /// Normalize every term, assign default weights, and (unless exact
    /// matching was requested) expand related terms from the alias map
    /// and the fuzzy index, deduplicating across each group.
    async fn prepare_and_resolve(
        &self,
        group: &mut SearchTermGroup,
        related_index: Option<&Arc<dyn RelatedTermsIndex>>,
        dedupe: bool,
        exact_match: bool,
    ) -> Result<()> {
        self.resolve_group(group, related_index, dedupe, exact_match)
            .await
    }

    fn resolve_group<'b>(
        &'b self,
        group: &'b mut SearchTermGroup,
        related_index: Option<&'b Arc<dyn RelatedTermsIndex>>,
        dedupe: bool,
        exact_match: bool,
    ) -> BoxFuture<'b, Result<()>> {
        Box::pin(async move {
            let boolean_op = group.boolean_op;
            {
                let mut terms = direct_terms(group);
                for term in terms.iter_mut() {
                    self.prepare_search_term(term);
                }
                if !exact_match {
                    if let Some(index) = related_index {
                        resolve_related_for_terms(index, &mut terms).await?;
                        for term in terms.iter_mut() {
                            self.promote_near_exact_related(term);
                        }
                    }
                    // Shared related terms skew scores through
                    // over-counting; keep each to its strongest owner.
                    dedupe_related_terms(&mut terms, dedupe && boolean_op != BooleanOp::And);
                }
            }
            for entry in &mut group.terms {
                if let SearchTermGroupEntry::Group(nested) = entry {
                    self.resolve_group(nested, related_index, dedupe, exact_match)
                        .await?;
                }
            }
            Ok(())
        })
    }

    fn prepare_search_term(&self, search_term: &mut SearchTerm) {
        search_term.term.text = normalize_term(&search_term.term.text);
        if search_term.term.weight.is_none() {
            search_term.term.weight = Some(self.default_term_match_weight);
        }
        if let Some(related_terms) = &mut search_term.related_terms {
            for related in related_terms {
                related.text = normalize_term(&related.text);
            }
        }
    }

    /// A related term scored nearly identical to its search term matches
    /// as if exact.
    fn promote_near_exact_related(&self, search_term: &mut SearchTerm) {
        if let Some(related_terms) = &mut search_term.related_terms {
            for related in related_terms {
                if related
                    .weight
                    .is_some_and(|w| w >= self.related_is_exact_threshold)
                {
                    related.weight = Some(self.default_term_match_weight);
                }
            }
        }
    }

    async fn compile_scope(
        &self,
        filter: Option<&WhenFilter>,
        scope_groups: Vec<SearchTermGroup>,
        tag_group: Option<SearchTermGroup>,
    ) -> Result<Option<ScopeExpr>> {
        let mut selectors: Vec<TextRangeSelector> = Vec::new();

        if let Some(date_range) = filter.and_then(|f| f.date_range) {
            selectors.push(TextRangeSelector::InDateRange(date_range));
        }
        for scope_group in scope_groups {
            if let Some(selector) = self.message_selector(&scope_group) {
                selectors.push(selector);
            }
        }
        if let Some(ranges) = filter.and_then(|f| f.text_ranges_in_scope.clone()) {
            selectors.push(TextRangeSelector::Ranges(ranges));
        }
        if let Some(tag_group) = tag_group {
            if let Some(selector) = self.message_selector(&tag_group) {
                selectors.push(selector);
            }
        }
        if let Some(description) = filter.and_then(|f| f.thread_description.as_deref()) {
            if let Some(ranges) = self.thread_ranges(description).await? {
                selectors.push(TextRangeSelector::Ranges(ranges));
            }
        }

        Ok((!selectors.is_empty()).then_some(ScopeExpr { selectors }))
    }

    fn message_selector(&self, group: &SearchTermGroup) -> Option<TextRangeSelector> {
        if group.is_empty() {
            return None;
        }
        let children = self.compile_group_children(group);
        Some(TextRangeSelector::FromMessages(MessageMatchExpr {
            op: group.boolean_op,
            children,
        }))
    }

    async fn thread_ranges(&self, description: &str) -> Result<Option<Vec<TextRange>>> {
        let threads: Arc<dyn ConversationThreads> = self
            .conversation
            .provider()
            .get_conversation_threads()
            .await?;
        let matches = threads.lookup_thread(description, None, None).await?;
        if matches.is_empty() {
            return Ok(None);
        }
        let all = threads.threads().await?;
        let mut ranges = Vec::new();
        for scored in matches {
            if let Some(thread) = all.get(scored.thread_ordinal) {
                ranges.extend(thread.ranges.iter().copied());
            }
        }
        Ok(Some(ranges))
    }

    fn compile_group(&self, group: &SearchTermGroup, scope: Option<ScopeExpr>) -> SemanticRefExpr {
        SemanticRefExpr::Boolean {
            op: group.boolean_op,
            children: self.compile_group_children(group),
            scope,
        }
    }

    fn compile_group_children(&self, group: &SearchTermGroup) -> Vec<SemanticRefExpr> {
        group
            .terms
            .iter()
            .map(|entry| match entry {
                SearchTermGroupEntry::Term(term) => SemanticRefExpr::MatchSearchTerm {
                    term: term.clone(),
                    entity_boost: Some(
                        self.entity_term_match_weight / self.default_term_match_weight,
                    ),
                },
                SearchTermGroupEntry::Property(pst) => self.compile_property_term(pst),
                SearchTermGroupEntry::Group(nested) => self.compile_group(nested, None),
            })
            .collect()
    }

    fn compile_property_term(&self, term: &PropertySearchTerm) -> SemanticRefExpr {
        if let PropertyNameTerm::Known(name) = &term.property_name {
            if name == properties::TAG {
                return SemanticRefExpr::MatchKind {
                    kind: KnowledgeKind::Tag,
                    value: term.property_value.clone(),
                };
            }
            if name == properties::TOPIC {
                return SemanticRefExpr::MatchKind {
                    kind: KnowledgeKind::Topic,
                    value: term.property_value.clone(),
                };
            }
        }
        SemanticRefExpr::MatchPropertyTerm { term: term.clone() }
    }
}

/// Collect the action property terms of a group into an `and` group; any
/// present make the query inherently scope-selecting.
pub fn action_terms_from_group(group: &SearchTermGroup) -> Option<SearchTermGroup> {
    let mut action_group: Option<SearchTermGroup> = None;
    for entry in &group.terms {
        if let SearchTermGroupEntry::Property(pst) = entry {
            if pst.is_action_property() {
                action_group
                    .get_or_insert_with(|| SearchTermGroup::new(BooleanOp::And))
                    .terms
                    .push(SearchTermGroupEntry::Property(pst.clone()));
            }
        }
    }
    action_group
}

/// Tags scope queries through exact tag property matches.
pub fn tag_search_term_group(tags: &[String]) -> SearchTermGroup {
    let mut group = SearchTermGroup::new(BooleanOp::OrMax);
    for tag in tags {
        group
            .terms
            .push(SearchTermGroupEntry::Property(PropertySearchTerm {
                property_name: PropertyNameTerm::Known(properties::TAG.to_string()),
                property_value: SearchTerm::exact(tag.clone()),
            }));
    }
    group
}

/// The direct search terms of a group: plain terms, property values, and
/// searched facet names. Nested groups are not included.
fn direct_terms(group: &mut SearchTermGroup) -> Vec<&mut SearchTerm> {
    let mut terms = Vec::new();
    for entry in &mut group.terms {
        match entry {
            SearchTermGroupEntry::Term(search_term) => terms.push(search_term),
            SearchTermGroupEntry::Property(pst) => {
                let PropertySearchTerm {
                    property_name,
                    property_value,
                } = pst;
                if let PropertyNameTerm::Facet(name_term) = property_name {
                    terms.push(name_term);
                }
                terms.push(property_value);
            }
            SearchTermGroupEntry::Group(_) => {}
        }
    }
    terms
}

/// Fill in `related_terms` for terms that have none: aliases first, then
/// the fuzzy index in one batched lookup. Terms with `related_terms`
/// already set (including the empty exact-match marker) are left alone.
async fn resolve_related_for_terms(
    index: &Arc<dyn RelatedTermsIndex>,
    terms: &mut [&mut SearchTerm],
) -> Result<()> {
    let aliases: Arc<dyn TermToRelatedTerms> = index.aliases();
    let mut needs_fuzzy: Vec<usize> = Vec::new();
    for (i, search_term) in terms.iter_mut().enumerate() {
        if search_term.is_wildcard() || search_term.related_terms.is_some() {
            continue;
        }
        search_term.related_terms = aliases.lookup_term(&search_term.term.text).await?;
        if search_term.related_terms.is_none() {
            needs_fuzzy.push(i);
        }
    }
    if needs_fuzzy.is_empty() {
        return Ok(());
    }
    let fuzzy: Arc<dyn RelatedTermsFuzzyIndex> = index.fuzzy();
    let texts: Vec<String> = needs_fuzzy
        .iter()
        .map(|&i| terms[i].term.text.clone())
        .collect();
    let resolved = fuzzy.lookup_terms(&texts, None, None).await?;
    for (&i, related) in needs_fuzzy.iter().zip(resolved) {
        terms[i].related_terms = Some(related);
    }
    Ok(())
}

/// Keep every related term attached to at most one search term (the one
/// that gave it its maximum weight), and never to a term that is itself
/// searched.
fn dedupe_related_terms(terms: &mut [&mut SearchTerm], ensure_single_occurrence: bool) {
    let mut all_search_terms = TermSet::new();
    for search_term in terms.iter() {
        all_search_terms.add(search_term.term.clone());
    }
    let mut all_related_terms: Option<TermSet> = None;
    if ensure_single_occurrence {
        let mut set = TermSet::new();
        for search_term in terms.iter() {
            if let Some(related_terms) = &search_term.related_terms {
                for related in related_terms {
                    set.add_or_union(related);
                }
            }
        }
        all_related_terms = Some(set);
    }

    for search_term in terms.iter_mut() {
        let Some(related_terms) = &mut search_term.related_terms else {
            continue;
        };
        if related_terms.is_empty() {
            continue;
        }
        let mut unique: Vec<Term> = Vec::with_capacity(related_terms.len());
        for candidate in related_terms.drain(..) {
            if all_search_terms.has(&candidate) {
                // Already searched in its own right.
                continue;
            }
            match &mut all_related_terms {
                Some(all_related) => {
                    let keep = all_related
                        .get(&candidate)
                        .is_some_and(|max| max.weight == candidate.weight);
                    if keep {
                        unique.push(candidate.clone());
                        all_related.remove(&candidate);
                    }
                }
                None => unique.push(candidate),
            }
        }
        *related_terms = unique;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term_with_related(text: &str, related: &[(&str, f32)]) -> SearchTerm {
        SearchTerm {
            term: Term::new(text),
            related_terms: Some(
                related
                    .iter()
                    .map(|(t, w)| Term::with_weight(*t, *w))
                    .collect(),
            ),
        }
    }

    #[test]
    fn shared_related_term_goes_to_strongest_owner_once() {
        let mut a = term_with_related("a", &[("x", 0.7)]);
        let mut b = term_with_related("b", &[("x", 0.9)]);
        let mut terms = vec![&mut a, &mut b];
        dedupe_related_terms(&mut terms, true);
        assert!(a.related_terms.as_ref().unwrap().is_empty());
        let b_related = b.related_terms.as_ref().unwrap();
        assert_eq!(b_related.len(), 1);
        assert_eq!(b_related[0].text, "x");
    }

    #[test]
    fn equal_weights_keep_first_owner_only() {
        let mut a = term_with_related("a", &[("x", 0.9)]);
        let mut b = term_with_related("b", &[("x", 0.9)]);
        let mut terms = vec![&mut a, &mut b];
        dedupe_related_terms(&mut terms, true);
        let total: usize = [&a, &b]
            .iter()
            .map(|t| t.related_terms.as_ref().unwrap().len())
            .sum();
        assert_eq!(total, 1);
        assert_eq!(a.related_terms.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn related_term_already_searched_is_dropped() {
        let mut a = term_with_related("a", &[("b", 0.8)]);
        let mut b = term_with_related("b", &[]);
        let mut terms = vec![&mut a, &mut b];
        dedupe_related_terms(&mut terms, false);
        assert!(a.related_terms.as_ref().unwrap().is_empty());
    }

    #[test]
    fn action_terms_are_extracted_for_scope() {
        let mut group = SearchTermGroup::new(BooleanOp::Or);
        group
            .terms
            .push(SearchTermGroupEntry::Property(PropertySearchTerm {
                property_name: PropertyNameTerm::Known("subject".into()),
                property_value: SearchTerm::new("alice"),
            }));
        group
            .terms
            .push(SearchTermGroupEntry::Term(SearchTerm::new("hello")));
        let action_group = action_terms_from_group(&group).unwrap();
        assert_eq!(action_group.boolean_op, BooleanOp::And);
        assert_eq!(action_group.terms.len(), 1);

        let mut no_actions = SearchTermGroup::new(BooleanOp::Or);
        no_actions
            .terms
            .push(SearchTermGroupEntry::Term(SearchTerm::new("hello")));
        assert!(action_terms_from_group(&no_actions).is_none());
    }
}
