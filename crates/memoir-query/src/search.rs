//! Top-level conversation search: compile a term group, evaluate the
//! knowledge query, then the message query, and package ranked results.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use memoir_core::{
    Conversation, KnowledgeKind, ScoredMessageOrdinal, ScoredSemanticRefOrdinal,
};

use crate::algebra::{SearchTermGroup, WhenFilter};
use crate::compiler::QueryCompiler;
use crate::ops::QueryEvalContext;

/// Knobs for one search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub max_knowledge_matches: Option<usize>,
    /// Disable related-term expansion entirely.
    #[serde(default)]
    pub exact_match: bool,
    pub max_message_matches: Option<usize>,
    /// Cap on the cumulative character count of matched messages.
    pub max_chars_in_budget: Option<usize>,
    pub threshold_score: Option<f32>,
}

/// Matches of one knowledge kind: the scored semref ordinals plus the
/// terms that produced them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticRefSearchResult {
    pub term_matches: std::collections::BTreeSet<String>,
    pub semantic_ref_matches: Vec<ScoredSemanticRefOrdinal>,
}

/// The result of one conversation search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSearchResult {
    pub message_matches: Vec<ScoredMessageOrdinal>,
    pub knowledge_matches: BTreeMap<KnowledgeKind, SemanticRefSearchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_query_text: Option<String>,
}

impl ConversationSearchResult {
    pub fn is_empty(&self) -> bool {
        self.message_matches.is_empty() && self.knowledge_matches.is_empty()
    }
}

/// One select expression of a structured query: a term group plus its
/// constraints.
#[derive(Debug, Clone)]
pub struct SearchSelectExpr {
    pub search_term_group: SearchTermGroup,
    pub when: Option<WhenFilter>,
}

/// A structured query compiled from natural language: one or more select
/// expressions, each searched independently.
#[derive(Debug, Clone)]
pub struct SearchQueryExpr {
    pub select_expressions: Vec<SearchSelectExpr>,
    pub raw_query: Option<String>,
}

/// Search for knowledge matching the term group and filter.
pub async fn search_conversation_knowledge(
    conversation: &Conversation,
    search_term_group: SearchTermGroup,
    when_filter: Option<&WhenFilter>,
    options: &SearchOptions,
) -> Result<BTreeMap<KnowledgeKind, SemanticRefSearchResult>> {
    let compiler = QueryCompiler::new(conversation);
    let knowledge_query = compiler
        .compile_knowledge_query(search_term_group, when_filter, options)
        .await?;
    let mut ctx = QueryEvalContext::new(conversation).await?;
    let groups = knowledge_query.eval(&mut ctx).await?;
    let results: BTreeMap<KnowledgeKind, SemanticRefSearchResult> = groups
        .into_iter()
        .filter(|(_, acc)| !acc.matches.is_empty())
        .map(|(kind, acc)| {
            (
                kind,
                SemanticRefSearchResult {
                    term_matches: acc.search_term_matches.clone(),
                    semantic_ref_matches: acc.to_scored_ordinals(),
                },
            )
        })
        .collect();
    debug!(kinds = results.len(), "knowledge search complete");
    Ok(results)
}

/// Search for knowledge and the messages it anchors to.
pub async fn search_conversation(
    conversation: &Conversation,
    search_term_group: SearchTermGroup,
    when_filter: Option<&WhenFilter>,
    options: &SearchOptions,
    raw_search_query: Option<&str>,
) -> Result<ConversationSearchResult> {
    let knowledge_matches =
        search_conversation_knowledge(conversation, search_term_group, when_filter, options)
            .await?;

    let compiler = QueryCompiler::new(conversation);
    let message_query = compiler
        .compile_message_query(knowledge_matches.clone(), options, raw_search_query)
        .await?;
    let mut ctx = QueryEvalContext::new(conversation).await?;
    let message_matches = message_query.eval(&mut ctx).await?;

    Ok(ConversationSearchResult {
        message_matches,
        knowledge_matches,
        raw_query_text: raw_search_query.map(|s| s.to_string()),
    })
}

/// Run every select expression of a structured query and collect the
/// non-empty results.
pub async fn run_search_query(
    conversation: &Conversation,
    query: SearchQueryExpr,
    options: &SearchOptions,
) -> Result<Vec<ConversationSearchResult>> {
    let mut results = Vec::new();
    for select in query.select_expressions {
        let result = search_conversation(
            conversation,
            select.search_term_group,
            select.when.as_ref(),
            options,
            query.raw_query.as_deref(),
        )
        .await?;
        results.push(result);
    }
    Ok(results)
}
