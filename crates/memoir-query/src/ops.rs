//! Compiled query plan: tagged operator enums evaluated by one
//! interpreter. Evaluation is async because index lookups can suspend on
//! the SQLite backend; the in-memory paths complete without blocking.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use memoir_core::{
    Conversation, DateRange, KnowledgeKind, MessageCollection, MessageTextIndex,
    PropertyToSemanticRefIndex, ScoredMessageOrdinal, ScoredSemanticRefOrdinal,
    SemanticRefCollection, SemanticRefOrdinal, StorageProvider, Term, TermToSemanticRefIndex,
    TextRange, TimestampToTextRangeIndex, properties,
};

use crate::algebra::{BooleanOp, PropertyNameTerm, PropertySearchTerm, SearchTerm, WILDCARD};
use crate::collections::{
    MessageAccumulator, PropertyTermSet, SemanticRefAccumulator, TermSet, TextRangeCollection,
    TextRangesInScope,
};
use crate::search::SemanticRefSearchResult;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything an operator needs while evaluating, plus the bookkeeping
/// that keeps one term from being counted twice inside a boolean group.
pub struct QueryEvalContext {
    pub messages: Arc<dyn MessageCollection>,
    pub semantic_refs: Arc<dyn SemanticRefCollection>,
    pub semantic_ref_index: Arc<dyn TermToSemanticRefIndex>,
    pub property_index: Arc<dyn PropertyToSemanticRefIndex>,
    pub timestamp_index: Arc<dyn TimestampToTextRangeIndex>,
    pub message_text_index: Arc<dyn MessageTextIndex>,
    pub matched_terms: TermSet,
    pub matched_property_terms: PropertyTermSet,
    pub text_ranges_in_scope: Option<TextRangesInScope>,
}

impl QueryEvalContext {
    pub async fn new(conversation: &Conversation) -> Result<Self> {
        let provider = conversation.provider();
        Ok(Self {
            messages: provider.get_message_collection().await?,
            semantic_refs: provider.get_semantic_ref_collection().await?,
            semantic_ref_index: provider.get_semantic_ref_index().await?,
            property_index: provider.get_property_index().await?,
            timestamp_index: provider.get_timestamp_index().await?,
            message_text_index: provider.get_message_text_index().await?,
            matched_terms: TermSet::new(),
            matched_property_terms: PropertyTermSet::new(),
            text_ranges_in_scope: None,
        })
    }

    pub fn clear_matched_terms(&mut self) {
        self.matched_terms.clear();
        self.matched_property_terms.clear();
    }

    fn scope(&self) -> Option<&TextRangesInScope> {
        self.text_ranges_in_scope
            .as_ref()
            .filter(|scope| !scope.is_empty())
    }

    /// Primary-index lookup with scope filtering and the entity boost.
    async fn lookup_term_filtered(
        &self,
        text: &str,
        boost: Option<(&Term, f32)>,
    ) -> Result<Vec<ScoredSemanticRefOrdinal>> {
        let scored = self.semantic_ref_index.lookup_term(text).await?;
        if scored.is_empty() || (self.scope().is_none() && boost.is_none()) {
            return Ok(scored);
        }
        let ordinals: Vec<SemanticRefOrdinal> =
            scored.iter().map(|s| s.semantic_ref_ordinal).collect();
        let semantic_refs = self.semantic_refs.get_multiple(&ordinals).await?;
        let mut filtered = Vec::with_capacity(scored.len());
        for (mut entry, semantic_ref) in scored.into_iter().zip(&semantic_refs) {
            if let Some(scope) = self.scope() {
                if !scope.is_range_in_scope(&semantic_ref.range) {
                    continue;
                }
            }
            if let Some((term, boost_weight)) = boost {
                if let memoir_core::Knowledge::Entity(entity) = &semantic_ref.knowledge {
                    if match_entity_name_or_type(&term.text, entity) {
                        entry.score *= boost_weight;
                    }
                }
            }
            filtered.push(entry);
        }
        Ok(filtered)
    }

    /// Primary-index lookup restricted to one knowledge kind.
    async fn lookup_term_of_kind(
        &self,
        text: &str,
        kind: KnowledgeKind,
    ) -> Result<Vec<ScoredSemanticRefOrdinal>> {
        let scored = self.semantic_ref_index.lookup_term(text).await?;
        if scored.is_empty() {
            return Ok(scored);
        }
        let ordinals: Vec<SemanticRefOrdinal> =
            scored.iter().map(|s| s.semantic_ref_ordinal).collect();
        let semantic_refs = self.semantic_refs.get_multiple(&ordinals).await?;
        Ok(scored
            .into_iter()
            .zip(&semantic_refs)
            .filter(|(_, semantic_ref)| {
                semantic_ref.knowledge_kind() == kind
                    && self
                        .scope()
                        .map_or(true, |scope| scope.is_range_in_scope(&semantic_ref.range))
            })
            .map(|(entry, _)| entry)
            .collect())
    }

    /// Property-index lookup with scope filtering.
    async fn lookup_property_filtered(
        &self,
        property_name: &str,
        value: &str,
    ) -> Result<Vec<ScoredSemanticRefOrdinal>> {
        let scored = self.property_index.lookup_property(property_name, value).await?;
        let Some(scope) = self.scope() else {
            return Ok(scored);
        };
        if scored.is_empty() {
            return Ok(scored);
        }
        let ordinals: Vec<SemanticRefOrdinal> =
            scored.iter().map(|s| s.semantic_ref_ordinal).collect();
        let semantic_refs = self.semantic_refs.get_multiple(&ordinals).await?;
        Ok(scored
            .into_iter()
            .zip(&semantic_refs)
            .filter(|(_, semantic_ref)| scope.is_range_in_scope(&semantic_ref.range))
            .map(|(entry, _)| entry)
            .collect())
    }
}

/// Case-insensitive match of a term against an entity's name or types.
pub fn match_entity_name_or_type(term_text: &str, entity: &memoir_core::ConcreteEntity) -> bool {
    entity.name.eq_ignore_ascii_case(term_text)
        || entity
            .types
            .iter()
            .any(|entity_type| entity_type.eq_ignore_ascii_case(term_text))
}

/// Predicate applied by [`SemanticRefExpr::Where`].
#[derive(Debug, Clone)]
pub enum SemanticRefPredicate {
    KnowledgeKind(KnowledgeKind),
}

/// Selects the text ranges a scope allows.
#[derive(Debug, Clone)]
pub enum TextRangeSelector {
    InDateRange(DateRange),
    FromMessages(MessageMatchExpr),
    Ranges(Vec<TextRange>),
}

/// `GetScope`: concatenated range selectors; every selector must accept a
/// range for it to stay in scope.
#[derive(Debug, Clone)]
pub struct ScopeExpr {
    pub selectors: Vec<TextRangeSelector>,
}

/// Boolean combination of term matches projected onto messages; used by
/// scope compilation.
#[derive(Debug, Clone)]
pub struct MessageMatchExpr {
    pub op: BooleanOp,
    pub children: Vec<SemanticRefExpr>,
}

/// Operators producing semantic-ref accumulators.
#[derive(Debug, Clone)]
pub enum SemanticRefExpr {
    /// Look up a term and its related terms, summing scores; entity-typed
    /// matches on name or type are boosted.
    MatchSearchTerm {
        term: SearchTerm,
        entity_boost: Option<f32>,
    },
    /// Property-name-exact path or facet path.
    MatchPropertyTerm { term: PropertySearchTerm },
    /// Topic and tag lookups route through the primary index restricted
    /// to their knowledge kind; a wildcard matches every ref of the kind.
    MatchKind {
        kind: KnowledgeKind,
        value: SearchTerm,
    },
    Boolean {
        op: BooleanOp,
        children: Vec<SemanticRefExpr>,
        scope: Option<ScopeExpr>,
    },
    Where {
        src: Box<SemanticRefExpr>,
        predicates: Vec<SemanticRefPredicate>,
    },
}

impl SemanticRefExpr {
    pub fn eval<'a>(
        &'a self,
        ctx: &'a mut QueryEvalContext,
    ) -> BoxFuture<'a, Result<SemanticRefAccumulator>> {
        Box::pin(async move {
            match self {
                SemanticRefExpr::MatchSearchTerm { term, entity_boost } => {
                    let mut acc = SemanticRefAccumulator::new();
                    accumulate_search_term(ctx, &mut acc, term, *entity_boost).await?;
                    Ok(acc)
                }
                SemanticRefExpr::MatchPropertyTerm { term } => {
                    let mut acc = SemanticRefAccumulator::new();
                    accumulate_property_term(ctx, &mut acc, term).await?;
                    Ok(acc)
                }
                SemanticRefExpr::MatchKind { kind, value } => {
                    let mut acc = SemanticRefAccumulator::new();
                    accumulate_kind_term(ctx, &mut acc, *kind, value).await?;
                    Ok(acc)
                }
                SemanticRefExpr::Boolean {
                    op,
                    children,
                    scope,
                } => {
                    if let Some(scope) = scope {
                        let ranges = scope.eval(ctx).await?;
                        ctx.text_ranges_in_scope = Some(ranges);
                    }
                    // Fresh term bookkeeping for every boolean group;
                    // scope evaluation above runs its own sub-queries.
                    ctx.clear_matched_terms();
                    match op {
                        BooleanOp::Or => {
                            let mut acc = SemanticRefAccumulator::new();
                            for child in children {
                                acc.add_union(child.eval(ctx).await?);
                            }
                            Ok(acc)
                        }
                        BooleanOp::OrMax => {
                            let mut acc = SemanticRefAccumulator::new();
                            for child in children {
                                acc.add_union(child.eval(ctx).await?);
                            }
                            let max_hits = acc.matches.get_max_hit_count();
                            acc.matches.select_with_hit_count(max_hits);
                            Ok(acc)
                        }
                        BooleanOp::And => {
                            let mut result: Option<SemanticRefAccumulator> = None;
                            for child in children {
                                let child_acc = child.eval(ctx).await?;
                                result = Some(match result {
                                    None => child_acc,
                                    Some(acc) => acc.intersect(&child_acc),
                                });
                                if result.as_ref().is_some_and(|acc| acc.matches.is_empty()) {
                                    break;
                                }
                            }
                            Ok(result.unwrap_or_default())
                        }
                    }
                }
                SemanticRefExpr::Where { src, predicates } => {
                    let acc = src.eval(ctx).await?;
                    let mut ordinals: Vec<SemanticRefOrdinal> = acc.matches.values().collect();
                    ordinals.sort_unstable();
                    let semantic_refs = ctx.semantic_refs.get_multiple(&ordinals).await?;
                    let mut filtered = SemanticRefAccumulator {
                        matches: Default::default(),
                        search_term_matches: acc.search_term_matches.clone(),
                    };
                    for semantic_ref in &semantic_refs {
                        let passes = predicates.iter().all(|predicate| match predicate {
                            SemanticRefPredicate::KnowledgeKind(kind) => {
                                semantic_ref.knowledge_kind() == *kind
                            }
                        });
                        if passes {
                            if let Some(entry) =
                                acc.matches.get(semantic_ref.semantic_ref_ordinal)
                            {
                                filtered.matches.set(*entry);
                            }
                        }
                    }
                    Ok(filtered)
                }
            }
        })
    }
}

async fn accumulate_search_term(
    ctx: &mut QueryEvalContext,
    acc: &mut SemanticRefAccumulator,
    term: &SearchTerm,
    entity_boost: Option<f32>,
) -> Result<()> {
    if term.is_wildcard() {
        return Ok(());
    }
    if !ctx.matched_terms.has(&term.term) {
        let boost = entity_boost.map(|b| (&term.term, b));
        let scored = ctx.lookup_term_filtered(&term.term.text, boost).await?;
        acc.add_term_matches(&term.term, &scored, term.term.weight);
        ctx.matched_terms.add(term.term.clone());
    }
    if let Some(related_terms) = &term.related_terms {
        for related in related_terms {
            if ctx.matched_terms.has(related) {
                continue;
            }
            let boost = entity_boost.map(|b| (related, b));
            let scored = ctx.lookup_term_filtered(&related.text, boost).await?;
            // Related matches count as matches for the primary term but
            // score with the related term's weight.
            acc.add_term_matches(&term.term, &scored, related.weight);
            ctx.matched_terms.add(related.clone());
        }
    }
    Ok(())
}

async fn accumulate_property_term(
    ctx: &mut QueryEvalContext,
    acc: &mut SemanticRefAccumulator,
    term: &PropertySearchTerm,
) -> Result<()> {
    match &term.property_name {
        PropertyNameTerm::Known(name) => {
            accumulate_property_value(ctx, acc, name, &term.property_value).await
        }
        PropertyNameTerm::Facet(name_term) => {
            // Facet path: the name matches facet.name, the value (unless
            // a wildcard) matches facet.value.
            accumulate_property_value(ctx, acc, properties::FACET_NAME, name_term).await?;
            if !term.property_value.is_wildcard() {
                accumulate_property_value(ctx, acc, properties::FACET_VALUE, &term.property_value)
                    .await?;
            }
            Ok(())
        }
    }
}

async fn accumulate_property_value(
    ctx: &mut QueryEvalContext,
    acc: &mut SemanticRefAccumulator,
    property_name: &str,
    value: &SearchTerm,
) -> Result<()> {
    if value.is_wildcard() {
        return Ok(());
    }
    if !ctx.matched_property_terms.has(property_name, &value.term.text) {
        let scored = ctx
            .lookup_property_filtered(property_name, &value.term.text)
            .await?;
        acc.add_term_matches(&value.term, &scored, value.term.weight);
        ctx.matched_property_terms
            .add(property_name, &value.term.text);
    }
    if let Some(related_terms) = &value.related_terms {
        for related in related_terms {
            if ctx.matched_property_terms.has(property_name, &related.text) {
                continue;
            }
            let scored = ctx
                .lookup_property_filtered(property_name, &related.text)
                .await?;
            acc.add_term_matches(&value.term, &scored, related.weight);
            ctx.matched_property_terms.add(property_name, &related.text);
        }
    }
    Ok(())
}

async fn accumulate_kind_term(
    ctx: &mut QueryEvalContext,
    acc: &mut SemanticRefAccumulator,
    kind: KnowledgeKind,
    value: &SearchTerm,
) -> Result<()> {
    let kind_name = kind.to_string();
    if value.is_wildcard() {
        // Match every semref of this kind.
        let size = ctx.semantic_refs.size().await?;
        let weight = value.term.weight.unwrap_or(1.0);
        for semantic_ref in ctx.semantic_refs.get_slice(0, size).await? {
            if semantic_ref.knowledge_kind() != kind {
                continue;
            }
            if let Some(scope) = ctx.scope() {
                if !scope.is_range_in_scope(&semantic_ref.range) {
                    continue;
                }
            }
            acc.matches.add(semantic_ref.semantic_ref_ordinal, weight);
        }
        acc.search_term_matches.insert(WILDCARD.to_string());
        return Ok(());
    }
    if !ctx.matched_property_terms.has(&kind_name, &value.term.text) {
        let scored = ctx.lookup_term_of_kind(&value.term.text, kind).await?;
        acc.add_term_matches(&value.term, &scored, value.term.weight);
        ctx.matched_property_terms.add(&kind_name, &value.term.text);
    }
    if let Some(related_terms) = &value.related_terms {
        for related in related_terms {
            if ctx.matched_property_terms.has(&kind_name, &related.text) {
                continue;
            }
            let scored = ctx.lookup_term_of_kind(&related.text, kind).await?;
            acc.add_term_matches(&value.term, &scored, related.weight);
            ctx.matched_property_terms.add(&kind_name, &related.text);
        }
    }
    Ok(())
}

impl ScopeExpr {
    pub async fn eval(&self, ctx: &mut QueryEvalContext) -> Result<TextRangesInScope> {
        let mut scope = TextRangesInScope::new();
        for selector in &self.selectors {
            let collection = match selector {
                TextRangeSelector::InDateRange(date_range) => {
                    let stamped = ctx.timestamp_index.lookup_range(date_range).await?;
                    TextRangeCollection::from_ranges(stamped.into_iter().map(|s| s.range))
                }
                TextRangeSelector::FromMessages(expr) => {
                    let matches = expr.eval(ctx).await?;
                    TextRangeCollection::from_ranges(
                        matches
                            .matches
                            .values()
                            .map(|ordinal| TextRange::from_message_chunk(ordinal, 0)),
                    )
                }
                TextRangeSelector::Ranges(ranges) => {
                    TextRangeCollection::from_ranges(ranges.iter().copied())
                }
            };
            scope.add_text_ranges(collection);
        }
        Ok(scope)
    }
}

impl MessageMatchExpr {
    pub async fn eval(&self, ctx: &mut QueryEvalContext) -> Result<MessageAccumulator> {
        ctx.clear_matched_terms();
        let mut accumulators = Vec::with_capacity(self.children.len());
        for child in &self.children {
            let semref_acc = child.eval(ctx).await?;
            accumulators.push(message_accumulator_from_semrefs(ctx, &semref_acc).await?);
        }
        let mut iter = accumulators.into_iter();
        let mut result = iter.next().unwrap_or_default();
        match self.op {
            BooleanOp::Or => {
                for acc in iter {
                    result.add_union(acc);
                }
            }
            BooleanOp::OrMax => {
                for acc in iter {
                    result.add_union(acc);
                }
                let max_hits = result.matches.get_max_hit_count();
                result.matches.select_with_hit_count(max_hits);
            }
            BooleanOp::And => {
                for acc in iter {
                    result = result.intersect(&acc);
                    if result.matches.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(result)
    }
}

async fn message_accumulator_from_semrefs(
    ctx: &QueryEvalContext,
    acc: &SemanticRefAccumulator,
) -> Result<MessageAccumulator> {
    let mut ordinals: Vec<SemanticRefOrdinal> = acc.matches.values().collect();
    ordinals.sort_unstable();
    let semantic_refs = ctx.semantic_refs.get_multiple(&ordinals).await?;
    let scores: HashMap<SemanticRefOrdinal, f32> = acc
        .matches
        .matches()
        .map(|m| (m.value, m.score))
        .collect();
    let mut messages = MessageAccumulator::new();
    messages.add_semantic_refs(&semantic_refs, &scores);
    Ok(messages)
}

/// Operators producing per-kind knowledge groups.
#[derive(Debug, Clone)]
pub enum KnowledgeExpr {
    GroupByKind {
        src: SemanticRefExpr,
    },
    /// Per-kind top-N selection.
    SelectTopNGroup {
        src: Box<KnowledgeExpr>,
        max_matches: Option<usize>,
    },
}

impl KnowledgeExpr {
    pub fn eval<'a>(
        &'a self,
        ctx: &'a mut QueryEvalContext,
    ) -> BoxFuture<'a, Result<BTreeMap<KnowledgeKind, SemanticRefAccumulator>>> {
        Box::pin(async move {
            match self {
                KnowledgeExpr::GroupByKind { src } => {
                    let acc = src.eval(ctx).await?;
                    let mut ordinals: Vec<SemanticRefOrdinal> = acc.matches.values().collect();
                    ordinals.sort_unstable();
                    let semantic_refs = ctx.semantic_refs.get_multiple(&ordinals).await?;
                    let mut groups: BTreeMap<KnowledgeKind, SemanticRefAccumulator> =
                        BTreeMap::new();
                    for semantic_ref in &semantic_refs {
                        let group = groups
                            .entry(semantic_ref.knowledge_kind())
                            .or_insert_with(|| SemanticRefAccumulator {
                                matches: Default::default(),
                                search_term_matches: acc.search_term_matches.clone(),
                            });
                        if let Some(entry) = acc.matches.get(semantic_ref.semantic_ref_ordinal) {
                            group.matches.set(*entry);
                        }
                    }
                    Ok(groups)
                }
                KnowledgeExpr::SelectTopNGroup { src, max_matches } => {
                    let mut groups = src.eval(ctx).await?;
                    if let Some(max) = max_matches {
                        for group in groups.values_mut() {
                            group.matches.select_top_n(*max);
                        }
                    }
                    Ok(groups)
                }
            }
        })
    }
}

/// Operators producing ranked message matches.
#[derive(Debug, Clone)]
pub enum MessageExpr {
    /// Project knowledge matches onto the messages their ranges cover.
    FromKnowledge {
        results: BTreeMap<KnowledgeKind, SemanticRefSearchResult>,
    },
    /// Re-rank by cosine similarity against the raw query embedding.
    RankBySimilarity {
        src: Box<MessageExpr>,
        embedding: Vec<f32>,
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    },
    SelectTopN {
        src: Box<MessageExpr>,
        max_matches: usize,
    },
    /// Stop accumulating messages once the cumulative chunk length would
    /// exceed the budget.
    WithinCharBudget {
        src: Box<MessageExpr>,
        max_chars: usize,
    },
    NoOp {
        src: Box<MessageExpr>,
    },
}

impl MessageExpr {
    pub fn eval<'a>(
        &'a self,
        ctx: &'a mut QueryEvalContext,
    ) -> BoxFuture<'a, Result<Vec<ScoredMessageOrdinal>>> {
        Box::pin(async move {
            match self {
                MessageExpr::FromKnowledge { results } => {
                    let mut messages = MessageAccumulator::new();
                    for result in results.values() {
                        let mut ordinals: Vec<SemanticRefOrdinal> = result
                            .semantic_ref_matches
                            .iter()
                            .map(|s| s.semantic_ref_ordinal)
                            .collect();
                        ordinals.sort_unstable();
                        let semantic_refs = ctx.semantic_refs.get_multiple(&ordinals).await?;
                        let scores: HashMap<SemanticRefOrdinal, f32> = result
                            .semantic_ref_matches
                            .iter()
                            .map(|s| (s.semantic_ref_ordinal, s.score))
                            .collect();
                        messages.add_semantic_refs(&semantic_refs, &scores);
                    }
                    Ok(messages.to_scored_ordinals())
                }
                MessageExpr::RankBySimilarity {
                    src,
                    embedding,
                    max_matches,
                    threshold_score,
                } => {
                    let matches = src.eval(ctx).await?;
                    if matches.is_empty() {
                        return Ok(matches);
                    }
                    let ordinals: Vec<usize> =
                        matches.iter().map(|m| m.message_ordinal).collect();
                    match ctx
                        .message_text_index
                        .lookup_in_subset_by_embedding(
                            embedding,
                            &ordinals,
                            *max_matches,
                            *threshold_score,
                        )
                        .await
                    {
                        Ok(ranked) => Ok(ranked),
                        Err(e) => {
                            // Ranking is best-effort; fall back to the
                            // knowledge-score order.
                            warn!(error = %e, "similarity rank step skipped");
                            let mut fallback = matches;
                            if let Some(max) = max_matches {
                                fallback.truncate(*max);
                            }
                            Ok(fallback)
                        }
                    }
                }
                MessageExpr::SelectTopN { src, max_matches } => {
                    let mut matches = src.eval(ctx).await?;
                    matches.truncate(*max_matches);
                    Ok(matches)
                }
                MessageExpr::WithinCharBudget { src, max_chars } => {
                    let matches = src.eval(ctx).await?;
                    let mut total = 0usize;
                    let mut selected = Vec::new();
                    for entry in matches {
                        let message = ctx.messages.get(entry.message_ordinal).await?;
                        let chars = message.char_count();
                        if total + chars > *max_chars && !selected.is_empty() {
                            break;
                        }
                        total += chars;
                        selected.push(entry);
                        if total >= *max_chars {
                            break;
                        }
                    }
                    Ok(selected)
                }
                MessageExpr::NoOp { src } => src.eval(ctx).await,
            }
        })
    }
}
