//! LLM-backed knowledge extraction: entities, actions and topics pulled
//! out of conversation text against a fixed response schema.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use memoir_core::{KnowledgeExtractor, KnowledgeResponse, MemoirError};

use crate::{extract_json, LLMClient};

/// The schema the model must emit, stated as TypeScript the way chat
/// models are usually schooled on it.
const KNOWLEDGE_SCHEMA: &str = r#"
type Quantity = { amount: number; units: string };
type Value = string | number | boolean | Quantity;
// A specific, inherent, defining, or non-immediate facet of an entity,
// such as "blue", "old", "famous", "sister". Facets are concise properties.
type Facet = { name: string; value: Value };
// Specific, tangible people, places, institutions or things only.
type ConcreteEntity = {
  name: string;
  // Types such as "person", "artist", "animal", "object", "instrument",
  // "school", "room", "museum", "food". Entity types are single words.
  type: string[];
  facets?: Facet[];
};
type ActionParam = string | { name: string; value: Value };
type VerbTense = "past" | "present" | "future";
type Action = {
  verbs: string[];
  verbTense: VerbTense;
  subjectEntityName: string | "none";
  objectEntityName: string | "none";
  indirectObjectEntityName: string | "none";
  params?: ActionParam[];
  subjectEntityFacet?: Facet;
};
type KnowledgeResponse = {
  entities: ConcreteEntity[];
  // subjectEntityName and objectEntityName must name entities in the
  // entities array.
  actions: Action[];
  // Actions expressed in reverse: (A give to B) --> (B receive from A).
  inverseActions: Action[];
  // Detailed, descriptive topics and keywords.
  topics: string[];
};
"#;

/// Knowledge extractor backed by an [`LLMClient`].
pub struct LlmKnowledgeExtractor {
    client: Arc<dyn LLMClient>,
    max_retries: u32,
}

impl LlmKnowledgeExtractor {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            max_retries: 2,
        }
    }

    fn build_prompt(text: &str) -> String {
        format!(
            "You are a service that translates user messages in a conversation into \
             JSON objects of type \"KnowledgeResponse\" according to the following \
             TypeScript definitions:\n```\n{KNOWLEDGE_SCHEMA}\n```\n\
             The following are messages in a conversation:\n\"\"\"\n{text}\n\"\"\"\n\
             The following is the message translated into a JSON object with 2 spaces \
             of indentation and no properties with the value undefined:\n"
        )
    }

    fn parse_response(raw: &str) -> Result<KnowledgeResponse> {
        let value = extract_json(raw)?;
        let response: KnowledgeResponse = serde_json::from_value(value)
            .map_err(|e| MemoirError::Extraction(format!("schema mismatch: {e}")))?;
        Ok(response)
    }
}

#[async_trait]
impl KnowledgeExtractor for LlmKnowledgeExtractor {
    async fn extract(&self, text: &str) -> Result<KnowledgeResponse> {
        let prompt = Self::build_prompt(text);
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.client.complete(&prompt).await {
                Ok(raw) => match Self::parse_response(&raw) {
                    Ok(response) => {
                        debug!(
                            entities = response.entities.len(),
                            actions = response.actions.len(),
                            topics = response.topics.len(),
                            "extracted knowledge"
                        );
                        return Ok(response);
                    }
                    Err(e) => last_error = Some(e),
                },
                Err(e) => last_error = Some(e),
            }
            debug!(attempt, "knowledge extraction attempt failed, retrying");
        }
        Err(MemoirError::Extraction(format!(
            "extraction failed after {} attempts: {}",
            self.max_retries + 1,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".into())
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockLLMClient;

    const RESPONSE: &str = r#"{
        "entities": [{"name": "Bach", "type": ["person", "composer"]}],
        "actions": [{
            "verbs": ["compose"],
            "verbTense": "past",
            "subjectEntityName": "Bach",
            "objectEntityName": "none",
            "indirectObjectEntityName": "none"
        }],
        "inverseActions": [],
        "topics": ["classical music"]
    }"#;

    #[tokio::test]
    async fn extracts_schema_conforming_responses() {
        let client = Arc::new(MockLLMClient::new().with_fallback(RESPONSE));
        let extractor = LlmKnowledgeExtractor::new(client);
        let response = extractor.extract("We talked about Bach").await.unwrap();
        assert_eq!(response.entities[0].name, "Bach");
        assert_eq!(response.actions[0].subject_entity_name, "Bach");
        assert_eq!(response.topics, vec!["classical music"]);
    }

    #[tokio::test]
    async fn malformed_responses_fail_after_retries() {
        let client = Arc::new(MockLLMClient::new().with_fallback("not json at all"));
        let extractor = LlmKnowledgeExtractor::new(client);
        let error = extractor.extract("anything").await.unwrap_err();
        assert!(error.to_string().contains("extraction failed"));
    }

    #[tokio::test]
    async fn batch_extraction_preserves_order() {
        let client = Arc::new(MockLLMClient::new().with_fallback(RESPONSE));
        let extractor = LlmKnowledgeExtractor::new(client);
        let responses = extractor
            .extract_batch(&["one".to_string(), "two".to_string()])
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);
    }
}
