//! Conversation file format: a camelCase JSON document plus a companion
//! `*_embeddings.bin` holding concatenated float32 embeddings in insertion
//! order — related-terms rows first, then message-chunk rows, with both
//! counts declared in the JSON header.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use memoir_core::{
    Conversation, ConversationMessage, ConversationSettings, MemoirError, MessageCollection,
    SemanticRef, SemanticRefCollection, StorageProvider, TextLocation, Thread,
};
use memoir_embed::EmbeddingModel;

use crate::builders::{build_property_index, build_timestamp_index};
use crate::memory::relterms_index::TermToRelatedTermsData;
use crate::memory::semref_index::TermToSemanticRefIndexData;
use crate::memory::MemoryStorageProvider;

pub const DATA_FILE_SUFFIX: &str = "_data.json";
pub const EMBEDDING_FILE_SUFFIX: &str = "_embeddings.bin";

/// Counts of embedding rows in the companion binary file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingFileHeader {
    pub related_count: usize,
    pub message_count: usize,
}

/// Fuzzy term embeddings on the wire: the text items are always present
/// so the index restores without re-embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEmbeddingIndexData {
    pub text_items: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedTermsIndexData {
    pub alias_data: TermToRelatedTermsData,
    pub text_embedding_data: TextEmbeddingIndexData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageIndexData {
    pub text_locations: Vec<TextLocation>,
    pub text_items: Vec<String>,
}

/// The persisted conversation document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationData {
    pub name_tag: String,
    pub messages: Vec<ConversationMessage>,
    pub tags: Vec<String>,
    pub semantic_refs: Vec<SemanticRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_index_data: Option<TermToSemanticRefIndexData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_terms_index_data: Option<RelatedTermsIndexData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_data: Option<Vec<Thread>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_index_data: Option<MessageIndexData>,
    #[serde(default)]
    pub embedding_file_header: EmbeddingFileHeader,
}

fn data_path(base: &Path) -> std::path::PathBuf {
    append_suffix(base, DATA_FILE_SUFFIX)
}

fn embeddings_path(base: &Path) -> std::path::PathBuf {
    append_suffix(base, EMBEDDING_FILE_SUFFIX)
}

fn append_suffix(base: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    base.with_file_name(name)
}

/// Write `<base>_data.json` and `<base>_embeddings.bin` from an in-memory
/// conversation.
pub async fn save_conversation(
    conversation: &Conversation,
    provider: &MemoryStorageProvider,
    base: impl AsRef<Path>,
) -> Result<()> {
    let base = base.as_ref();
    let (messages, semantic_refs, semref_index, related_terms, message_index) = provider.parts();

    let message_count = messages.size().await?;
    let all_messages = messages.get_slice(0, message_count).await?;
    let semref_count = semantic_refs.size().await?;
    let all_semantic_refs = semantic_refs.get_slice(0, semref_count).await?;

    let (related_texts, related_bytes) = related_terms.fuzzy_index().to_parts().await;
    let (locations, chunk_texts, message_bytes) = message_index.to_parts().await;
    let header = EmbeddingFileHeader {
        related_count: related_texts.len(),
        message_count: locations.len(),
    };

    let data = ConversationData {
        name_tag: conversation.name_tag.clone(),
        messages: all_messages,
        tags: conversation.tags.clone(),
        semantic_refs: all_semantic_refs,
        semantic_index_data: Some(semref_index.to_data()),
        related_terms_index_data: Some(RelatedTermsIndexData {
            alias_data: related_terms.alias_map().to_data(),
            text_embedding_data: TextEmbeddingIndexData {
                text_items: related_texts.clone(),
            },
        }),
        thread_data: None,
        message_index_data: Some(MessageIndexData {
            text_locations: locations,
            text_items: chunk_texts,
        }),
        embedding_file_header: header,
    };

    std::fs::write(data_path(base), serde_json::to_vec_pretty(&data)?)
        .with_context(|| format!("failed to write {}", data_path(base).display()))?;
    let mut blob = related_bytes;
    blob.extend_from_slice(&message_bytes);
    std::fs::write(embeddings_path(base), blob)
        .with_context(|| format!("failed to write {}", embeddings_path(base).display()))?;
    Ok(())
}

/// Load a conversation saved by [`save_conversation`] into a fresh
/// in-memory provider, rebuilding the transient property and timestamp
/// indexes from the collections.
pub async fn load_conversation(
    base: impl AsRef<Path>,
    model: Arc<dyn EmbeddingModel>,
    settings: &ConversationSettings,
) -> Result<(Conversation, Arc<MemoryStorageProvider>)> {
    let base = base.as_ref();
    let json = std::fs::read(data_path(base))
        .with_context(|| format!("failed to read {}", data_path(base).display()))?;
    let data: ConversationData = serde_json::from_slice(&json)?;
    let blob = std::fs::read(embeddings_path(base))
        .with_context(|| format!("failed to read {}", embeddings_path(base).display()))?;

    let dimension = model.dimension();
    let related_bytes_len = data.embedding_file_header.related_count * dimension * 4;
    let message_bytes_len = data.embedding_file_header.message_count * dimension * 4;
    if blob.len() != related_bytes_len + message_bytes_len {
        return Err(MemoirError::storage(format!(
            "embedding file length {} does not match declared counts {:?}",
            blob.len(),
            data.embedding_file_header
        ))
        .into());
    }

    let provider = Arc::new(MemoryStorageProvider::new(model, settings));
    let (messages, semantic_refs, semref_index, related_terms, message_index) = provider.parts();

    messages.extend(data.messages).await?;
    semantic_refs.extend(data.semantic_refs).await?;
    if let Some(index_data) = data.semantic_index_data {
        semref_index.load_data(index_data);
    }
    if let Some(related_data) = data.related_terms_index_data {
        related_terms.alias_map().load_data(related_data.alias_data);
        related_terms
            .fuzzy_index()
            .load_parts(
                related_data.text_embedding_data.text_items,
                &blob[..related_bytes_len],
            )
            .await?;
    }
    if let Some(message_data) = data.message_index_data {
        message_index
            .load_parts(
                message_data.text_locations,
                message_data.text_items,
                &blob[related_bytes_len..],
            )
            .await?;
    }

    let conversation = Conversation::new(data.name_tag, data.tags, provider.clone());
    build_property_index(&conversation).await?;
    build_timestamp_index(&conversation).await?;
    Ok((conversation, provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders;
    use memoir_core::{MessageMeta, PropertyToSemanticRefIndex, TermToSemanticRefIndex};
    use memoir_embed::MockEmbeddingModel;

    fn settings() -> ConversationSettings {
        let mut settings = ConversationSettings::default();
        settings.message_text_index.embedding_dimension = 32;
        settings.message_text_index.min_score = 0.0;
        settings
    }

    #[tokio::test]
    async fn conversation_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("podcast");
        let model: Arc<dyn EmbeddingModel> = Arc::new(MockEmbeddingModel::new(32));
        let settings = settings();

        let provider = Arc::new(MemoryStorageProvider::new(model.clone(), &settings));
        let conversation = Conversation::new("ep1", vec!["test".into()], provider.clone());
        conversation
            .provider()
            .get_message_collection()
            .await
            .unwrap()
            .append(
                ConversationMessage::new(
                    vec!["Alice said hello to Bob".into()],
                    MessageMeta::Transcript {
                        speaker: Some("alice".into()),
                        listeners: vec!["bob".into()],
                    },
                )
                .with_timestamp("2024-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
        builders::add_metadata_to_index(&conversation, None)
            .await
            .unwrap();
        builders::build_property_index(&conversation).await.unwrap();
        builders::build_timestamp_index(&conversation).await.unwrap();
        builders::build_message_index(&conversation).await.unwrap();
        builders::build_related_terms_index(&conversation)
            .await
            .unwrap();

        save_conversation(&conversation, &provider, &base).await.unwrap();
        let (loaded, loaded_provider) = load_conversation(&base, model, &settings).await.unwrap();

        assert_eq!(loaded.name_tag, "ep1");
        let (_, semantic_refs, semref_index, _, _) = loaded_provider.parts();
        assert_eq!(
            semantic_refs.size().await.unwrap(),
            provider.parts().1.size().await.unwrap()
        );
        let hits = semref_index.lookup_term("alice").await.unwrap();
        assert!(!hits.is_empty());

        // Transient indexes are rebuilt on load.
        let property_index = loaded.provider().get_property_index().await.unwrap();
        assert!(!property_index
            .lookup_property("subject", "alice")
            .await
            .unwrap()
            .is_empty());
    }
}
