//! Stage 1 of the query pipeline: translate user text into a structured
//! [`SearchQuery`]. A non-conforming model response fails the whole query;
//! no partial results are produced downstream.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use memoir_core::MemoirError;
use memoir_query::SearchQuery;

use crate::{extract_json, LLMClient};

const SEARCH_QUERY_SCHEMA: &str = r#"
type FacetTerm = {
  // The name of the facet, such as "color", "profession"; "*" matches any.
  facetName: string;
  // The value of the facet, such as "red", "writer"; "*" matches any.
  facetValue: string;
};
// Use for specific, tangible people, places, institutions or things only.
// Abstract concepts or topics are not entity terms; use searchTerms.
type EntityTerm = {
  // "*" matches any entity name.
  name: string;
  isNamePronoun?: boolean;
  // Specific types such as "book", "movie", "person", "speaker". Generic
  // types like "object" or "thing" are NOT allowed. Single words only.
  type?: string[];
  facets?: FacetTerm[];
};
type VerbsTerm = {
  // Individual words of a single or compound verb.
  words: string[];
  tense: "Past" | "Present" | "Future";
};
type ActionTerm = {
  actionVerbs?: VerbsTerm;
  // The origin of the action; "*" means any.
  actorEntities?: EntityTerm[] | "*";
  // The recipient or target of the action.
  targetEntities?: EntityTerm[];
  // Other entities participating in the action.
  additionalEntities?: EntityTerm[];
  // True when the phrase asks for information about entities ("What is
  // Mia's phone number?"), false for interactions between entities.
  isInformational: boolean;
};
type SearchFilter = {
  actionSearchTerm?: ActionTerm;
  // entitySearchTerms must not repeat entities in actionSearchTerm.
  entitySearchTerms?: EntityTerm[];
  // Concepts, topics or other terms that fit neither actions nor
  // entities. Never include noise words like "topic" or "discussion".
  // Use an empty array when the user asks for summaries.
  searchTerms?: string[];
  // Only when the request explicitly names a time range, year, month etc.
  timeRange?: {
    startDate: { date: { year: number; month: number; day: number };
                 time?: { hour: number; minute: number; seconds: number } };
    stopDate?: { date: { year: number; month: number; day: number };
                 time?: { hour: number; minute: number; seconds: number } };
  };
};
type SearchExpr = {
  // The query rewritten to stand alone, with references like "it" or
  // "that" resolved.
  rewrittenQuery: string;
  filters: SearchFilter[];
};
type SearchQuery = {
  // One expression for each search the user request requires.
  searchExpressions: SearchExpr[];
};
"#;

/// Translates natural-language questions into structured search queries.
pub struct SearchQueryTranslator {
    client: Arc<dyn LLMClient>,
}

impl SearchQueryTranslator {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self { client }
    }

    fn build_prompt(&self, query_text: &str, time_range_hint: Option<&str>) -> String {
        let hint = time_range_hint
            .map(|h| format!("The conversation spans the time range {h}.\n"))
            .unwrap_or_default();
        format!(
            "{hint}You are a service that translates user questions about a \
             conversation into JSON objects of type \"SearchQuery\" according to the \
             following TypeScript definitions:\n```\n{SEARCH_QUERY_SCHEMA}\n```\n\
             The following is the user question:\n\"\"\"\n{query_text}\n\"\"\"\n\
             The following is the user question translated into a JSON object with 2 \
             spaces of indentation and no properties with the value undefined:\n"
        )
    }

    /// Translate `query_text`; the optional hint tells the model what
    /// time span the conversation covers.
    pub async fn translate(
        &self,
        query_text: &str,
        time_range_hint: Option<&str>,
    ) -> Result<SearchQuery> {
        let prompt = self.build_prompt(query_text, time_range_hint);
        let raw = self
            .client
            .complete(&prompt)
            .await
            .map_err(|e| MemoirError::Translation(e.to_string()))?;
        let value =
            extract_json(&raw).map_err(|e| MemoirError::Translation(e.to_string()))?;
        let query: SearchQuery = serde_json::from_value(value)
            .map_err(|e| MemoirError::Translation(format!("schema mismatch: {e}")))?;
        debug!(
            expressions = query.search_expressions.len(),
            "translated query"
        );
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockLLMClient;

    #[tokio::test]
    async fn conforming_responses_translate() {
        let response = r#"{
            "searchExpressions": [{
                "rewrittenQuery": "What did Alice say about the budget?",
                "filters": [{
                    "actionSearchTerm": {
                        "actionVerbs": {"words": ["say"], "tense": "Past"},
                        "actorEntities": [{"name": "Alice", "isNamePronoun": false}],
                        "isInformational": false
                    },
                    "searchTerms": ["budget"]
                }]
            }]
        }"#;
        let client = Arc::new(MockLLMClient::new().with_fallback(response));
        let translator = SearchQueryTranslator::new(client);
        let query = translator
            .translate("What did Alice say about the budget?", None)
            .await
            .unwrap();
        assert_eq!(query.search_expressions.len(), 1);
        assert_eq!(
            query.search_expressions[0].rewritten_query,
            "What did Alice say about the budget?"
        );
    }

    #[tokio::test]
    async fn non_conforming_responses_are_translation_failures() {
        let client = Arc::new(MockLLMClient::new().with_fallback(r#"{"wrong": true}"#));
        let translator = SearchQueryTranslator::new(client);
        let error = translator.translate("anything", None).await.unwrap_err();
        assert!(error.to_string().contains("translation failed"));
    }
}
