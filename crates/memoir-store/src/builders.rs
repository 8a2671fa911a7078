//! Index builders: populate the primary, property, timestamp, message-text
//! and related-terms indexes from the message stream and extracted
//! knowledge.
//!
//! Full build order: metadata-derived semrefs first, then LLM-extracted
//! semrefs over message text (batched), then the secondary indexes.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use memoir_core::{
    properties, Action, ConcreteEntity, Conversation, ConversationSettings, Facet, Knowledge,
    KnowledgeExtractor, KnowledgeResponse, KnowledgeValidator, MessageCollection, MessageOrdinal,
    MessageTextIndex, PropertyToSemanticRefIndex, RelatedTermsFuzzyIndex, RelatedTermsIndex,
    ScoredSemanticRefOrdinal,
    SemanticRef, SemanticRefCollection, SemanticRefOrdinal, StorageProvider, Tag, Term,
    TermToRelatedTerms, TermToSemanticRefIndex, TextLocation, TextRange, TimestampToTextRangeIndex,
    Topic, NONE_ENTITY,
};

const BUNDLED_TRANSCRIPT_VERBS: &str = include_str!("../assets/transcript_verbs.json");

/// Counts reported after a full index build.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexingCounts {
    pub messages: usize,
    pub semantic_refs: usize,
    pub terms: usize,
}

/// Curated verb aliases bundled with the crate.
pub fn load_bundled_aliases() -> Result<Vec<(String, Vec<Term>)>> {
    let map: BTreeMap<String, Vec<String>> = serde_json::from_str(BUNDLED_TRANSCRIPT_VERBS)
        .context("bundled transcript verb aliases are malformed")?;
    Ok(map
        .into_iter()
        .map(|(term, aliases)| (term, aliases.into_iter().map(Term::new).collect()))
        .collect())
}

async fn append_semantic_ref(
    semantic_refs: &Arc<dyn SemanticRefCollection>,
    range: TextRange,
    knowledge: Knowledge,
) -> Result<SemanticRefOrdinal> {
    let ordinal = semantic_refs.size().await?;
    semantic_refs
        .append(SemanticRef::new(ordinal, range, knowledge))
        .await
}

async fn add_term(
    index: &Arc<dyn TermToSemanticRefIndex>,
    term: &str,
    ordinal: SemanticRefOrdinal,
) -> Result<()> {
    index
        .add_term(term, ScoredSemanticRefOrdinal::new(ordinal, 1.0))
        .await?;
    Ok(())
}

async fn add_facet_terms(
    index: &Arc<dyn TermToSemanticRefIndex>,
    facet: &Facet,
    ordinal: SemanticRefOrdinal,
) -> Result<()> {
    add_term(index, &facet.name, ordinal).await?;
    add_term(index, &facet.value.to_string(), ordinal).await?;
    Ok(())
}

/// Append an entity semref and register its name, each type, and each
/// facet name and value as terms.
pub async fn add_entity_to_index(
    entity: &ConcreteEntity,
    semantic_refs: &Arc<dyn SemanticRefCollection>,
    index: &Arc<dyn TermToSemanticRefIndex>,
    message_ordinal: MessageOrdinal,
    chunk_ordinal: usize,
) -> Result<SemanticRefOrdinal> {
    let ordinal = append_semantic_ref(
        semantic_refs,
        TextRange::from_message_chunk(message_ordinal, chunk_ordinal),
        Knowledge::Entity(entity.clone()),
    )
    .await?;
    add_term(index, &entity.name, ordinal).await?;
    for entity_type in &entity.types {
        add_term(index, entity_type, ordinal).await?;
    }
    if let Some(facets) = &entity.facets {
        for facet in facets {
            add_facet_terms(index, facet, ordinal).await?;
        }
    }
    Ok(ordinal)
}

/// Append an action semref and register its joined verbs, filled entity
/// roles, params, and subject facet as terms.
pub async fn add_action_to_index(
    action: &Action,
    semantic_refs: &Arc<dyn SemanticRefCollection>,
    index: &Arc<dyn TermToSemanticRefIndex>,
    message_ordinal: MessageOrdinal,
    chunk_ordinal: usize,
) -> Result<SemanticRefOrdinal> {
    let ordinal = append_semantic_ref(
        semantic_refs,
        TextRange::from_message_chunk(message_ordinal, chunk_ordinal),
        Knowledge::Action(action.clone()),
    )
    .await?;
    add_term(index, &action.joined_verbs(), ordinal).await?;
    for role in [
        &action.subject_entity_name,
        &action.object_entity_name,
        &action.indirect_object_entity_name,
    ] {
        if role != NONE_ENTITY {
            add_term(index, role, ordinal).await?;
        }
    }
    if let Some(params) = &action.params {
        for param in params {
            match param {
                memoir_core::ActionParam::Name(name) => add_term(index, name, ordinal).await?,
                memoir_core::ActionParam::NameValue(named) => {
                    add_term(index, &named.name, ordinal).await?;
                    if let memoir_core::FacetValue::String(value) = &named.value {
                        add_term(index, value, ordinal).await?;
                    }
                }
            }
        }
    }
    if let Some(facet) = &action.subject_entity_facet {
        add_facet_terms(index, facet, ordinal).await?;
    }
    Ok(ordinal)
}

/// Append a topic semref and register its text as a term.
pub async fn add_topic_to_index(
    topic: &Topic,
    semantic_refs: &Arc<dyn SemanticRefCollection>,
    index: &Arc<dyn TermToSemanticRefIndex>,
    message_ordinal: MessageOrdinal,
    chunk_ordinal: usize,
) -> Result<SemanticRefOrdinal> {
    let ordinal = append_semantic_ref(
        semantic_refs,
        TextRange::from_message_chunk(message_ordinal, chunk_ordinal),
        Knowledge::Topic(topic.clone()),
    )
    .await?;
    add_term(index, &topic.text, ordinal).await?;
    Ok(ordinal)
}

/// Append a tag semref and register its text as a term.
pub async fn add_tag_to_index(
    tag: &Tag,
    semantic_refs: &Arc<dyn SemanticRefCollection>,
    index: &Arc<dyn TermToSemanticRefIndex>,
    message_ordinal: MessageOrdinal,
) -> Result<SemanticRefOrdinal> {
    let ordinal = append_semantic_ref(
        semantic_refs,
        TextRange::from_message_chunk(message_ordinal, 0),
        Knowledge::Tag(tag.clone()),
    )
    .await?;
    add_term(index, &tag.text, ordinal).await?;
    Ok(ordinal)
}

/// Insert every piece of an extraction response for one message chunk:
/// entities, actions, inverse actions (indexed like actions), topics.
pub async fn add_knowledge_to_semantic_ref_index(
    conversation: &Conversation,
    message_ordinal: MessageOrdinal,
    chunk_ordinal: usize,
    response: &KnowledgeResponse,
) -> Result<()> {
    let provider = conversation.provider();
    let semantic_refs = provider.get_semantic_ref_collection().await?;
    let index = provider.get_semantic_ref_index().await?;
    for entity in &response.entities {
        if entity.name.is_empty() {
            continue;
        }
        add_entity_to_index(entity, &semantic_refs, &index, message_ordinal, chunk_ordinal)
            .await?;
    }
    for action in response.actions.iter().chain(&response.inverse_actions) {
        add_action_to_index(action, &semantic_refs, &index, message_ordinal, chunk_ordinal)
            .await?;
    }
    for topic in &response.topics {
        add_topic_to_index(
            &Topic {
                text: topic.clone(),
            },
            &semantic_refs,
            &index,
            message_ordinal,
            chunk_ordinal,
        )
        .await?;
    }
    Ok(())
}

/// Index the metadata-derived knowledge of every message, in ordinal
/// order. The validator, when present, can veto individual pieces.
pub async fn add_metadata_to_index(
    conversation: &Conversation,
    validator: Option<KnowledgeValidator>,
) -> Result<()> {
    let provider = conversation.provider();
    let messages = provider.get_message_collection().await?;
    let semantic_refs = provider.get_semantic_ref_collection().await?;
    let index = provider.get_semantic_ref_index().await?;

    let size = messages.size().await?;
    for message_ordinal in 0..size {
        let message = messages.get(message_ordinal).await?;
        let response = message.get_knowledge();
        for entity in &response.entities {
            let knowledge = Knowledge::Entity(entity.clone());
            if validator
                .as_ref()
                .map_or(true, |v| v(knowledge.kind(), &knowledge))
            {
                add_entity_to_index(entity, &semantic_refs, &index, message_ordinal, 0).await?;
            }
        }
        for action in response.actions.iter().chain(&response.inverse_actions) {
            let knowledge = Knowledge::Action(action.clone());
            if validator
                .as_ref()
                .map_or(true, |v| v(knowledge.kind(), &knowledge))
            {
                add_action_to_index(action, &semantic_refs, &index, message_ordinal, 0).await?;
            }
        }
        for topic_text in &response.topics {
            let topic = Topic {
                text: topic_text.clone(),
            };
            let knowledge = Knowledge::Topic(topic.clone());
            if validator
                .as_ref()
                .map_or(true, |v| v(knowledge.kind(), &knowledge))
            {
                add_topic_to_index(&topic, &semantic_refs, &index, message_ordinal, 0).await?;
            }
        }
        for tag_text in &message.tags {
            let tag = Tag {
                text: tag_text.clone(),
            };
            let knowledge = Knowledge::Tag(tag.clone());
            if validator
                .as_ref()
                .map_or(true, |v| v(knowledge.kind(), &knowledge))
            {
                add_tag_to_index(&tag, &semantic_refs, &index, message_ordinal).await?;
            }
        }
    }
    Ok(())
}

/// Run the knowledge extractor over every message chunk, in fixed-size
/// batches, and index the results. A failed batch aborts the build;
/// previously committed batches remain indexed.
pub async fn build_semantic_ref_index(
    conversation: &Conversation,
    settings: &ConversationSettings,
    extractor: &Arc<dyn KnowledgeExtractor>,
) -> Result<()> {
    let provider = conversation.provider();
    let messages = provider.get_message_collection().await?;
    let size = messages.size().await?;

    let mut batch: Vec<(TextLocation, String)> = Vec::new();
    for message_ordinal in 0..size {
        let message = messages.get(message_ordinal).await?;
        for (chunk_ordinal, chunk) in message.text_chunks.iter().enumerate() {
            let text = chunk.trim();
            if text.is_empty() {
                continue;
            }
            batch.push((
                TextLocation::new(message_ordinal, chunk_ordinal),
                text.to_string(),
            ));
            if batch.len() >= settings.semantic_ref_index.batch_size {
                extract_and_index_batch(conversation, extractor, &mut batch).await?;
            }
        }
    }
    extract_and_index_batch(conversation, extractor, &mut batch).await?;
    Ok(())
}

async fn extract_and_index_batch(
    conversation: &Conversation,
    extractor: &Arc<dyn KnowledgeExtractor>,
    batch: &mut Vec<(TextLocation, String)>,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
    let responses = extractor
        .extract_batch(&texts)
        .await
        .context("knowledge extraction failed")?;
    for ((location, _), response) in batch.iter().zip(&responses) {
        add_knowledge_to_semantic_ref_index(
            conversation,
            location.message_ordinal,
            location.chunk_ordinal,
            response,
        )
        .await?;
    }
    debug!(chunks = batch.len(), "indexed extraction batch");
    batch.clear();
    Ok(())
}

async fn add_property(
    index: &Arc<dyn PropertyToSemanticRefIndex>,
    name: &str,
    value: &str,
    ordinal: SemanticRefOrdinal,
) -> Result<()> {
    index
        .add_property(name, value, ScoredSemanticRefOrdinal::new(ordinal, 1.0))
        .await
}

async fn add_facet_properties(
    index: &Arc<dyn PropertyToSemanticRefIndex>,
    facet: &Facet,
    ordinal: SemanticRefOrdinal,
) -> Result<()> {
    add_property(index, properties::FACET_NAME, &facet.name, ordinal).await?;
    add_property(index, properties::FACET_VALUE, &facet.value.to_string(), ordinal).await?;
    Ok(())
}

/// Register one semref's properties. Topics carry no property entries;
/// their lookup path goes through the primary index.
pub async fn add_semantic_ref_properties(
    semantic_ref: &SemanticRef,
    index: &Arc<dyn PropertyToSemanticRefIndex>,
) -> Result<()> {
    let ordinal = semantic_ref.semantic_ref_ordinal;
    match &semantic_ref.knowledge {
        Knowledge::Entity(entity) => {
            add_property(index, properties::ENTITY_NAME, &entity.name, ordinal).await?;
            for entity_type in &entity.types {
                add_property(index, properties::ENTITY_TYPE, entity_type, ordinal).await?;
            }
            if let Some(facets) = &entity.facets {
                for facet in facets {
                    add_facet_properties(index, facet, ordinal).await?;
                }
            }
        }
        Knowledge::Action(action) => {
            add_property(index, properties::VERB, &action.joined_verbs(), ordinal).await?;
            for (name, role) in [
                (properties::SUBJECT, &action.subject_entity_name),
                (properties::OBJECT, &action.object_entity_name),
                (properties::INDIRECT_OBJECT, &action.indirect_object_entity_name),
            ] {
                if role != NONE_ENTITY {
                    add_property(index, name, role, ordinal).await?;
                }
            }
        }
        Knowledge::Tag(tag) => {
            add_property(index, properties::TAG, &tag.text, ordinal).await?;
        }
        Knowledge::Topic(_) => {}
    }
    Ok(())
}

/// Populate the property index from every semref at or after `start_at`.
pub async fn build_property_index(conversation: &Conversation) -> Result<()> {
    add_to_property_index(conversation, 0).await
}

pub async fn add_to_property_index(
    conversation: &Conversation,
    start_at: SemanticRefOrdinal,
) -> Result<()> {
    let provider = conversation.provider();
    let semantic_refs = provider.get_semantic_ref_collection().await?;
    let index = provider.get_property_index().await?;
    let size = semantic_refs.size().await?;
    for semantic_ref in semantic_refs.get_slice(start_at, size).await? {
        add_semantic_ref_properties(&semantic_ref, &index).await?;
    }
    Ok(())
}

/// Populate the timestamp index. Persistent message collections carry the
/// index implicitly on their timestamp column, so only transient
/// collections need an explicit pass.
pub async fn build_timestamp_index(conversation: &Conversation) -> Result<()> {
    let provider = conversation.provider();
    let messages = provider.get_message_collection().await?;
    if messages.is_persistent() {
        return Ok(());
    }
    let index = provider.get_timestamp_index().await?;
    let size = messages.size().await?;
    let mut entries: Vec<(MessageOrdinal, String)> = Vec::new();
    for (offset, message) in messages.get_slice(0, size).await?.into_iter().enumerate() {
        if let Some(timestamp) = message.timestamp {
            entries.push((offset, timestamp));
        }
    }
    index.add_timestamps(&entries).await
}

/// Embed every chunk of every message into the message-text index.
pub async fn build_message_index(conversation: &Conversation) -> Result<()> {
    let provider = conversation.provider();
    let messages = provider.get_message_collection().await?;
    let index = provider.get_message_text_index().await?;
    let size = messages.size().await?;
    let all = messages.get_slice(0, size).await?;
    index.add_messages_starting_at(0, &all).await
}

/// Load the curated aliases, then build the fuzzy index over every term
/// in the primary index.
pub async fn build_related_terms_index(conversation: &Conversation) -> Result<()> {
    let provider = conversation.provider();
    let related = provider.get_related_terms_index().await?;

    let aliases = related.aliases();
    for (term, alias_terms) in load_bundled_aliases()? {
        aliases.add_related_term(&term, alias_terms).await?;
    }

    let semref_index = provider.get_semantic_ref_index().await?;
    let terms = semref_index.get_terms().await?;
    if !terms.is_empty() {
        related.fuzzy().add_terms(&terms).await?;
    }
    Ok(())
}

/// Full build: metadata semrefs, extracted semrefs, then every secondary
/// index.
pub async fn build_conversation_index(
    conversation: &Conversation,
    settings: &ConversationSettings,
    extractor: Option<&Arc<dyn KnowledgeExtractor>>,
) -> Result<IndexingCounts> {
    add_metadata_to_index(conversation, None).await?;
    if settings.semantic_ref_index.auto_extract_knowledge {
        if let Some(extractor) = extractor {
            build_semantic_ref_index(conversation, settings, extractor).await?;
        }
    }
    build_property_index(conversation).await?;
    build_timestamp_index(conversation).await?;
    build_message_index(conversation).await?;
    build_related_terms_index(conversation).await?;

    let provider = conversation.provider();
    let counts = IndexingCounts {
        messages: provider.get_message_collection().await?.size().await?,
        semantic_refs: provider.get_semantic_ref_collection().await?.size().await?,
        terms: provider.get_semantic_ref_index().await?.size().await?,
    };
    info!(
        messages = counts.messages,
        semantic_refs = counts.semantic_refs,
        terms = counts.terms,
        "built conversation indexes"
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorageProvider;
    use memoir_core::{ConversationMessage, MessageMeta};
    use memoir_embed::MockEmbeddingModel;

    fn test_settings() -> ConversationSettings {
        let mut settings = ConversationSettings::default();
        settings.message_text_index.embedding_dimension = 32;
        settings.message_text_index.min_score = 0.0;
        settings.related_term_index.min_score = 0.0;
        settings
    }

    async fn conversation_with_messages(
        messages: Vec<ConversationMessage>,
    ) -> Conversation {
        let settings = test_settings();
        let provider = Arc::new(MemoryStorageProvider::new(
            Arc::new(MockEmbeddingModel::new(32)),
            &settings,
        ));
        let conversation = Conversation::new("test", Vec::new(), provider);
        conversation
            .provider()
            .get_message_collection()
            .await
            .unwrap()
            .extend(messages)
            .await
            .unwrap();
        conversation
    }

    fn transcript_message(text: &str, speaker: &str, listeners: &[&str]) -> ConversationMessage {
        ConversationMessage::new(
            vec![text.to_string()],
            MessageMeta::Transcript {
                speaker: Some(speaker.to_string()),
                listeners: listeners.iter().map(|l| l.to_string()).collect(),
            },
        )
    }

    #[tokio::test]
    async fn metadata_build_creates_expected_semrefs_and_terms() {
        let conversation = conversation_with_messages(vec![
            transcript_message("Alice said hello to Bob", "alice", &["bob"]),
            transcript_message("Bob replied with a greeting", "bob", &[]),
        ])
        .await;
        add_metadata_to_index(&conversation, None).await.unwrap();
        build_property_index(&conversation).await.unwrap();

        let provider = conversation.provider();
        let semantic_refs = provider.get_semantic_ref_collection().await.unwrap();
        let index = provider.get_semantic_ref_index().await.unwrap();
        let property_index = provider.get_property_index().await.unwrap();

        // M0: alice entity, bob entity, say action. M1: bob entity.
        assert_eq!(semantic_refs.size().await.unwrap(), 4);

        let alice_hits = index.lookup_term("alice").await.unwrap();
        assert!(!alice_hits.is_empty());
        let alice_ref = semantic_refs
            .get(alice_hits[0].semantic_ref_ordinal)
            .await
            .unwrap();
        assert!(matches!(
            alice_ref.knowledge,
            Knowledge::Entity(ref e) if e.name == "alice" && e.types == vec!["person".to_string()]
        ));

        let say_hits = property_index
            .lookup_property("subject", "alice")
            .await
            .unwrap();
        assert_eq!(say_hits.len(), 1);
        let action_ref = semantic_refs
            .get(say_hits[0].semantic_ref_ordinal)
            .await
            .unwrap();
        assert!(matches!(
            action_ref.knowledge,
            Knowledge::Action(ref a) if a.subject_entity_name == "alice"
                && a.object_entity_name == "bob"
        ));
    }

    #[tokio::test]
    async fn extraction_failure_aborts_but_keeps_committed_batches() {
        struct FailingExtractor;
        #[async_trait::async_trait]
        impl KnowledgeExtractor for FailingExtractor {
            async fn extract(&self, _text: &str) -> Result<KnowledgeResponse> {
                anyhow::bail!("model unavailable")
            }
        }

        let conversation =
            conversation_with_messages(vec![transcript_message("hello", "alice", &[])]).await;
        let extractor: Arc<dyn KnowledgeExtractor> = Arc::new(FailingExtractor);
        let settings = test_settings();
        let result = build_semantic_ref_index(&conversation, &settings, &extractor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn related_terms_build_covers_primary_terms() {
        let conversation = conversation_with_messages(vec![
            transcript_message("Alice said hello", "alice", &["bob"]),
        ])
        .await;
        add_metadata_to_index(&conversation, None).await.unwrap();
        build_related_terms_index(&conversation).await.unwrap();

        let related = conversation
            .provider()
            .get_related_terms_index()
            .await
            .unwrap();
        assert!(related.fuzzy().size().await.unwrap() > 0);
        let aliases = related.aliases();
        assert!(aliases.lookup_term("say").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn message_tags_become_tag_semrefs() {
        let mut message = transcript_message("hello", "alice", &[]);
        message.tags.push("intro".into());
        let conversation = conversation_with_messages(vec![message]).await;
        add_metadata_to_index(&conversation, None).await.unwrap();
        build_property_index(&conversation).await.unwrap();

        let property_index = conversation.provider().get_property_index().await.unwrap();
        let hits = property_index.lookup_property("tag", "intro").await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
