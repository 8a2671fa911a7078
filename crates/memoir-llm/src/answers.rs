//! Stage 4 input contract: turn ranked search results into a natural
//! language answer. Combining partial answers from multiple searches is
//! the generator's job, not the search engine's.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use memoir_core::{
    Conversation, Knowledge, MemoirError, MessageCollection, SemanticRefCollection,
    StorageProvider,
};
use memoir_query::ConversationSearchResult;

use crate::{extract_json, LLMClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerType {
    Answered,
    NoAnswer,
}

/// The generator's verdict for one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResponse {
    #[serde(rename = "type")]
    pub answer_type: AnswerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_no_answer: Option<String>,
}

/// Generates answers from ranked knowledge and message matches.
pub struct AnswerGenerator {
    client: Arc<dyn LLMClient>,
    /// Cap on the context characters handed to the model.
    pub max_context_chars: usize,
}

impl AnswerGenerator {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            max_context_chars: 16_000,
        }
    }

    /// Answer `question` from the given search results. Multiple results
    /// (from multi-expression queries) are combined into one context.
    pub async fn generate_answer(
        &self,
        conversation: &Conversation,
        question: &str,
        results: &[ConversationSearchResult],
    ) -> Result<AnswerResponse> {
        let context = self.build_context(conversation, results).await?;
        if context.is_empty() {
            return Ok(AnswerResponse {
                answer_type: AnswerType::NoAnswer,
                answer: None,
                why_no_answer: Some("No matching knowledge or messages were found.".into()),
            });
        }
        let prompt = format!(
            "Answer the user question using ONLY the conversation context below.\n\
             Context:\n\"\"\"\n{context}\n\"\"\"\n\
             Question: {question}\n\
             Respond with a JSON object: {{\"type\": \"Answered\" | \"NoAnswer\", \
             \"answer\"?: string, \"whyNoAnswer\"?: string}}. Use \"NoAnswer\" when \
             the context does not contain the answer.\nJSON:"
        );
        let raw = self.client.complete(&prompt).await?;
        let value = extract_json(&raw)
            .map_err(|e| MemoirError::Translation(format!("answer generation: {e}")))?;
        let response: AnswerResponse = serde_json::from_value(value)
            .map_err(|e| MemoirError::Translation(format!("answer schema mismatch: {e}")))?;
        Ok(response)
    }

    /// Relevant knowledge per kind, then relevant message text, in score
    /// order, truncated to the context budget.
    async fn build_context(
        &self,
        conversation: &Conversation,
        results: &[ConversationSearchResult],
    ) -> Result<String> {
        let provider = conversation.provider();
        let semantic_refs: Arc<dyn SemanticRefCollection> =
            provider.get_semantic_ref_collection().await?;
        let messages: Arc<dyn MessageCollection> = provider.get_message_collection().await?;

        let mut context = String::new();
        for result in results {
            for (kind, matches) in &result.knowledge_matches {
                if matches.semantic_ref_matches.is_empty() {
                    continue;
                }
                let _ = writeln!(context, "[{kind}]");
                for scored in &matches.semantic_ref_matches {
                    if context.len() >= self.max_context_chars {
                        break;
                    }
                    let semantic_ref = semantic_refs.get(scored.semantic_ref_ordinal).await?;
                    let _ = writeln!(context, "- {}", render_knowledge(&semantic_ref.knowledge));
                }
            }
            if !result.message_matches.is_empty() {
                let _ = writeln!(context, "[messages]");
                for scored in &result.message_matches {
                    if context.len() >= self.max_context_chars {
                        break;
                    }
                    let message = messages.get(scored.message_ordinal).await?;
                    let speaker = message.metadata.source().unwrap_or("unknown");
                    let _ = writeln!(
                        context,
                        "{}: {}",
                        speaker,
                        message.text_chunks.join(" ")
                    );
                }
            }
        }
        if context.len() > self.max_context_chars {
            let mut cut = self.max_context_chars;
            while !context.is_char_boundary(cut) {
                cut -= 1;
            }
            context.truncate(cut);
        }
        debug!(chars = context.len(), "built answer context");
        Ok(context)
    }
}

fn render_knowledge(knowledge: &Knowledge) -> String {
    match knowledge {
        Knowledge::Entity(entity) => {
            let mut text = format!("{} ({})", entity.name, entity.types.join(", "));
            if let Some(facets) = &entity.facets {
                for facet in facets {
                    let _ = write!(text, "; {}: {}", facet.name, facet.value);
                }
            }
            text
        }
        Knowledge::Action(action) => format!(
            "{} {} {}",
            action.subject_entity_name,
            action.joined_verbs(),
            action.object_entity_name
        ),
        Knowledge::Topic(topic) => topic.text.clone(),
        Knowledge::Tag(tag) => format!("#{}", tag.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::{ConcreteEntity, Tag, Topic};

    #[test]
    fn knowledge_renders_compactly() {
        let entity = Knowledge::Entity(ConcreteEntity::new(
            "Bach",
            vec!["person".into(), "composer".into()],
        ));
        assert_eq!(render_knowledge(&entity), "Bach (person, composer)");
        assert_eq!(
            render_knowledge(&Knowledge::Topic(Topic {
                text: "music".into()
            })),
            "music"
        );
        assert_eq!(
            render_knowledge(&Knowledge::Tag(Tag {
                text: "intro".into()
            })),
            "#intro"
        );
    }

    #[test]
    fn answer_response_wire_form_round_trips() {
        let json = r#"{"type": "Answered", "answer": "Alice greeted Bob."}"#;
        let response: AnswerResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.answer_type, AnswerType::Answered);
        assert_eq!(response.answer.as_deref(), Some("Alice greeted Bob."));

        let json = r#"{"type": "NoAnswer", "whyNoAnswer": "nothing relevant"}"#;
        let response: AnswerResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.answer_type, AnswerType::NoAnswer);
        assert!(response.why_no_answer.is_some());
    }
}
