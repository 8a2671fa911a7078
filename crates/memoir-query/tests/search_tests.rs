//! End-to-end search tests over both storage backends.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use memoir_core::{
    Conversation, ConversationMessage, ConversationSettings, KnowledgeKind, MessageCollection,
    MessageMeta, RelatedTermsIndex, SemanticRefCollection, StorageProvider, Term,
    TermToRelatedTerms,
};
use memoir_embed::{EmbeddingModel, MockEmbeddingModel};
use memoir_query::{
    search_conversation, search_conversation_knowledge, searchlib, SearchOptions,
    SearchTermGroup, SearchTermGroupEntry, WhenFilter,
};
use memoir_store::{
    add_metadata_to_index, build_message_index, build_property_index, build_related_terms_index,
    build_timestamp_index, MemoryStorageProvider, SqliteStorageProvider,
};

const DIMENSION: usize = 48;

fn settings() -> ConversationSettings {
    let mut settings = ConversationSettings::default();
    settings.message_text_index.embedding_dimension = DIMENSION;
    settings.message_text_index.min_score = 0.0;
    settings.related_term_index.min_score = 0.95;
    settings
}

fn model() -> Arc<dyn EmbeddingModel> {
    Arc::new(MockEmbeddingModel::new(DIMENSION))
}

fn transcript(text: &str, speaker: &str, listeners: &[&str]) -> ConversationMessage {
    ConversationMessage::new(
        vec![text.to_string()],
        MessageMeta::Transcript {
            speaker: Some(speaker.to_string()),
            listeners: listeners.iter().map(|l| l.to_string()).collect(),
        },
    )
}

/// The two-message fixture: Alice speaks to Bob, Bob replies.
fn greeting_messages() -> Vec<ConversationMessage> {
    vec![
        transcript("Alice said hello to Bob", "alice", &["bob"]),
        transcript("Bob replied with a greeting", "bob", &[]),
    ]
}

async fn memory_conversation(messages: Vec<ConversationMessage>) -> Conversation {
    let provider = Arc::new(MemoryStorageProvider::new(model(), &settings()));
    build_fixture(Conversation::new("fixture", Vec::new(), provider), messages).await
}

async fn sqlite_conversation(messages: Vec<ConversationMessage>) -> Conversation {
    let provider = Arc::new(
        SqliteStorageProvider::open(":memory:", "fixture", model(), &settings())
            .await
            .unwrap(),
    );
    build_fixture(Conversation::new("fixture", Vec::new(), provider), messages).await
}

async fn build_fixture(
    conversation: Conversation,
    messages: Vec<ConversationMessage>,
) -> Conversation {
    conversation
        .provider()
        .get_message_collection()
        .await
        .unwrap()
        .extend(messages)
        .await
        .unwrap();
    add_metadata_to_index(&conversation, None).await.unwrap();
    build_property_index(&conversation).await.unwrap();
    build_timestamp_index(&conversation).await.unwrap();
    build_message_index(&conversation).await.unwrap();
    build_related_terms_index(&conversation).await.unwrap();
    conversation
}

fn or_group(entries: Vec<SearchTermGroupEntry>) -> SearchTermGroup {
    searchlib::create_or_term_group(entries)
}

fn term_entry(text: &str) -> SearchTermGroupEntry {
    SearchTermGroupEntry::Term(searchlib::create_search_term(text, None, true))
}

fn property_entry(name: &str, value: &str) -> SearchTermGroupEntry {
    SearchTermGroupEntry::Property(searchlib::create_property_search_term(name, value, true))
}

#[tokio::test]
async fn greeting_fixture_finds_entities_and_say_action() {
    let conversation = memory_conversation(greeting_messages()).await;

    let matches = search_conversation_knowledge(
        &conversation,
        or_group(vec![term_entry("alice")]),
        None,
        &SearchOptions::default(),
    )
    .await
    .unwrap();

    let entities = matches.get(&KnowledgeKind::Entity).unwrap();
    assert!(!entities.semantic_ref_matches.is_empty());
    assert!(entities.term_matches.contains("alice"));
    // The say(alice -> bob) action also indexes "alice" as a term.
    let actions = matches.get(&KnowledgeKind::Action).unwrap();
    assert_eq!(actions.semantic_ref_matches.len(), 1);

    let matches = search_conversation_knowledge(
        &conversation,
        or_group(vec![property_entry("subject", "alice")]),
        None,
        &SearchOptions::default(),
    )
    .await
    .unwrap();
    let actions = matches.get(&KnowledgeKind::Action).unwrap();
    assert_eq!(actions.semantic_ref_matches.len(), 1);
    let semantic_refs = conversation
        .provider()
        .get_semantic_ref_collection()
        .await
        .unwrap();
    let action_ref = semantic_refs
        .get(actions.semantic_ref_matches[0].semantic_ref_ordinal)
        .await
        .unwrap();
    assert_eq!(action_ref.knowledge_kind(), KnowledgeKind::Action);
}

#[tokio::test]
async fn entity_matches_outscore_action_matches_for_entity_terms() {
    let conversation = memory_conversation(greeting_messages()).await;
    let matches = search_conversation_knowledge(
        &conversation,
        or_group(vec![term_entry("alice")]),
        None,
        &SearchOptions::default(),
    )
    .await
    .unwrap();
    let entity_score = matches.get(&KnowledgeKind::Entity).unwrap().semantic_ref_matches[0].score;
    let action_score = matches.get(&KnowledgeKind::Action).unwrap().semantic_ref_matches[0].score;
    // Entity name matches are boosted by entity weight / default weight.
    assert!(entity_score > action_score * 5.0);
}

#[tokio::test]
async fn or_unions_and_and_intersects() {
    let conversation = memory_conversation(greeting_messages()).await;

    // "alice" matches {alice entity, say action}; "bob" matches
    // {bob entity x2, say action}. Their union has all of them, their
    // intersection only the action.
    let or_matches = search_conversation_knowledge(
        &conversation,
        or_group(vec![term_entry("alice"), term_entry("bob")]),
        None,
        &SearchOptions::default(),
    )
    .await
    .unwrap();
    let or_total: usize = or_matches
        .values()
        .map(|r| r.semantic_ref_matches.len())
        .sum();
    assert_eq!(or_total, 4);

    let and_matches = search_conversation_knowledge(
        &conversation,
        searchlib::create_and_term_group(vec![term_entry("alice"), term_entry("bob")]),
        None,
        &SearchOptions::default(),
    )
    .await
    .unwrap();
    let and_total: usize = and_matches
        .values()
        .map(|r| r.semantic_ref_matches.len())
        .sum();
    assert_eq!(and_total, 1);
    assert!(and_matches.contains_key(&KnowledgeKind::Action));
}

#[tokio::test]
async fn or_max_keeps_only_maximum_hit_count() {
    let conversation = memory_conversation(greeting_messages()).await;
    // The say action matches both terms (hit count 2); entities match one
    // term each (hit count 1). or_max keeps only the action.
    let matches = search_conversation_knowledge(
        &conversation,
        searchlib::create_or_max_term_group(vec![term_entry("alice"), term_entry("bob")]),
        None,
        &SearchOptions::default(),
    )
    .await
    .unwrap();
    let total: usize = matches
        .values()
        .map(|r| r.semantic_ref_matches.len())
        .sum();
    assert_eq!(total, 1);
    assert!(matches.contains_key(&KnowledgeKind::Action));
}

#[tokio::test]
async fn top_n_truncates_knowledge_groups() {
    let conversation = memory_conversation(vec![
        transcript("one", "alice", &["bob", "carol", "dave"]),
        transcript("two", "bob", &[]),
    ])
    .await;
    let unlimited = search_conversation_knowledge(
        &conversation,
        or_group(vec![property_entry("type", "person")]),
        None,
        &SearchOptions::default(),
    )
    .await
    .unwrap();
    let all = unlimited.get(&KnowledgeKind::Entity).unwrap();
    assert!(all.semantic_ref_matches.len() > 2);

    let limited = search_conversation_knowledge(
        &conversation,
        or_group(vec![property_entry("type", "person")]),
        None,
        &SearchOptions {
            max_knowledge_matches: Some(2),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let top = limited.get(&KnowledgeKind::Entity).unwrap();
    assert_eq!(top.semantic_ref_matches.len(), 2);
    // Top-N keeps the head of the full descending sort.
    assert_eq!(
        top.semantic_ref_matches[0].semantic_ref_ordinal,
        all.semantic_ref_matches[0].semantic_ref_ordinal
    );
}

#[tokio::test]
async fn date_range_scope_excludes_messages_outside_range() {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let messages: Vec<ConversationMessage> = (0..5)
        .map(|i| {
            transcript(&format!("message {i}"), "alice", &[])
                .with_timestamp((base + chrono::Duration::hours(i)).to_rfc3339())
        })
        .collect();
    let conversation = memory_conversation(messages).await;

    let filter = WhenFilter {
        date_range: Some(memoir_core::DateRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap()),
        )),
        ..Default::default()
    };
    let result = search_conversation(
        &conversation,
        or_group(vec![term_entry("alice")]),
        Some(&filter),
        &SearchOptions::default(),
        None,
    )
    .await
    .unwrap();

    let semantic_refs = conversation
        .provider()
        .get_semantic_ref_collection()
        .await
        .unwrap();
    for matches in result.knowledge_matches.values() {
        for scored in &matches.semantic_ref_matches {
            let semantic_ref = semantic_refs.get(scored.semantic_ref_ordinal).await.unwrap();
            let ordinal = semantic_ref.range.start.message_ordinal;
            assert!((1..=2).contains(&ordinal), "out of scope: message {ordinal}");
        }
    }
    let message_ordinals: Vec<usize> = result
        .message_matches
        .iter()
        .map(|m| m.message_ordinal)
        .collect();
    assert!(!message_ordinals.is_empty());
    assert!(message_ordinals.iter().all(|o| (1..=2).contains(o)));
}

#[tokio::test]
async fn action_terms_imply_message_scope() {
    // Alice speaks in M0, Carol in M1; both mention the same topic term.
    let conversation = memory_conversation(vec![
        transcript("the budget is fine", "alice", &["bob"]),
        transcript("the budget is not fine", "carol", &["bob"]),
    ])
    .await;

    // subject=alice makes the query scope-selecting: knowledge from
    // Carol's message must not match.
    let group = or_group(vec![
        property_entry("subject", "alice"),
        property_entry("name", "carol"),
    ]);
    let matches = search_conversation_knowledge(
        &conversation,
        group,
        None,
        &SearchOptions::default(),
    )
    .await
    .unwrap();
    let semantic_refs = conversation
        .provider()
        .get_semantic_ref_collection()
        .await
        .unwrap();
    for result in matches.values() {
        for scored in &result.semantic_ref_matches {
            let semantic_ref = semantic_refs.get(scored.semantic_ref_ordinal).await.unwrap();
            assert_eq!(semantic_ref.range.start.message_ordinal, 0);
        }
    }
}

#[tokio::test]
async fn shared_alias_counts_once_under_or() {
    let conversation = memory_conversation(vec![transcript(
        "the gathering went well",
        "alice",
        &[],
    )])
    .await;
    // Both query terms alias to "alice"; expansion must count it once.
    let related = conversation
        .provider()
        .get_related_terms_index()
        .await
        .unwrap();
    related
        .aliases()
        .add_related_term("speaker", vec![Term::new("alice")])
        .await
        .unwrap();
    related
        .aliases()
        .add_related_term("host", vec![Term::new("alice")])
        .await
        .unwrap();

    let group = or_group(vec![
        SearchTermGroupEntry::Term(searchlib::create_search_term("speaker", None, false)),
        SearchTermGroupEntry::Term(searchlib::create_search_term("host", None, false)),
    ]);
    let matches =
        search_conversation_knowledge(&conversation, group, None, &SearchOptions::default())
            .await
            .unwrap();
    let entities = matches.get(&KnowledgeKind::Entity).unwrap();
    let alice = &entities.semantic_ref_matches[0];
    // One hit, not two: the alias was attached to a single search term.
    let provider = conversation.provider();
    let semantic_refs = provider.get_semantic_ref_collection().await.unwrap();
    let entity_ref = semantic_refs.get(alice.semantic_ref_ordinal).await.unwrap();
    assert_eq!(entity_ref.knowledge_kind(), KnowledgeKind::Entity);
    assert_eq!(entities.semantic_ref_matches.len(), 1);
    // Score reflects exactly one related-term contribution (weight 1.0
    // alias, boosted 10x as an entity name match).
    assert!((alice.score - 10.0).abs() < 1e-3);
}

#[tokio::test]
async fn raw_query_reranks_messages_by_similarity() {
    let conversation = memory_conversation(vec![
        transcript("hello greeting", "alice", &[]),
        transcript("farewell", "alice", &[]),
        transcript("budget numbers", "alice", &[]),
    ])
    .await;
    let result = search_conversation(
        &conversation,
        or_group(vec![property_entry("name", "alice")]),
        None,
        &SearchOptions {
            max_message_matches: Some(10),
            threshold_score: Some(0.0),
            ..Default::default()
        },
        Some("greeting"),
    )
    .await
    .unwrap();
    assert!(!result.message_matches.is_empty());
    assert_eq!(result.message_matches[0].message_ordinal, 0);
    for scored in &result.message_matches {
        assert!(scored.score >= 0.0 && scored.score <= 1.0 + 1e-4);
    }
    assert_eq!(result.raw_query_text.as_deref(), Some("greeting"));
}

#[tokio::test]
async fn char_budget_stops_accumulating_messages() {
    let conversation = memory_conversation(vec![
        transcript("aaaaaaaaaa", "alice", &[]),
        transcript("bbbbbbbbbb", "alice", &[]),
        transcript("cccccccccc", "alice", &[]),
    ])
    .await;
    let result = search_conversation(
        &conversation,
        or_group(vec![property_entry("name", "alice")]),
        None,
        &SearchOptions {
            max_chars_in_budget: Some(15),
            ..Default::default()
        },
        None,
    )
    .await
    .unwrap();
    assert_eq!(result.message_matches.len(), 1);
}

#[tokio::test]
async fn exact_match_skips_related_term_expansion() {
    let conversation = memory_conversation(greeting_messages()).await;
    let related = conversation
        .provider()
        .get_related_terms_index()
        .await
        .unwrap();
    related
        .aliases()
        .add_related_term("speaker", vec![Term::new("alice")])
        .await
        .unwrap();

    let exact = search_conversation_knowledge(
        &conversation,
        or_group(vec![SearchTermGroupEntry::Term(
            searchlib::create_search_term("speaker", None, false),
        )]),
        None,
        &SearchOptions {
            exact_match: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(exact.is_empty());
}

/// Identical fixture and query on both backends produce identical
/// knowledge and message matches.
#[tokio::test]
async fn sqlite_and_memory_backends_agree() {
    let memory = memory_conversation(greeting_messages()).await;
    let sqlite = sqlite_conversation(greeting_messages()).await;

    let group = || {
        or_group(vec![
            term_entry("alice"),
            property_entry("subject", "alice"),
        ])
    };
    let options = SearchOptions {
        max_message_matches: Some(10),
        threshold_score: Some(0.0),
        ..Default::default()
    };

    let memory_result = search_conversation(&memory, group(), None, &options, Some("greeting"))
        .await
        .unwrap();
    let sqlite_result = search_conversation(&sqlite, group(), None, &options, Some("greeting"))
        .await
        .unwrap();

    let kinds: Vec<_> = memory_result.knowledge_matches.keys().collect();
    assert_eq!(
        kinds,
        sqlite_result.knowledge_matches.keys().collect::<Vec<_>>()
    );
    for (kind, memory_matches) in &memory_result.knowledge_matches {
        let sqlite_matches = &sqlite_result.knowledge_matches[kind];
        let memory_ordinals: std::collections::BTreeSet<usize> = memory_matches
            .semantic_ref_matches
            .iter()
            .map(|s| s.semantic_ref_ordinal)
            .collect();
        let sqlite_ordinals: std::collections::BTreeSet<usize> = sqlite_matches
            .semantic_ref_matches
            .iter()
            .map(|s| s.semantic_ref_ordinal)
            .collect();
        assert_eq!(memory_ordinals, sqlite_ordinals, "kind {kind}");
    }

    assert_eq!(
        memory_result.message_matches.len(),
        sqlite_result.message_matches.len()
    );
    for (m, s) in memory_result
        .message_matches
        .iter()
        .zip(&sqlite_result.message_matches)
    {
        assert_eq!(m.message_ordinal, s.message_ordinal);
        assert!((m.score - s.score).abs() < 1e-6);
    }
}

#[tokio::test]
async fn sqlite_rehydrates_embeddings_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conversation.db");

    {
        let provider = Arc::new(
            SqliteStorageProvider::open(&path, "persisted", model(), &settings())
                .await
                .unwrap(),
        );
        let conversation = Conversation::new("persisted", Vec::new(), provider.clone());
        build_fixture(conversation, greeting_messages()).await;
        provider.close().await.unwrap();
    }

    let provider = Arc::new(
        SqliteStorageProvider::open(&path, "persisted", model(), &settings())
            .await
            .unwrap(),
    );
    let conversation = Conversation::new("persisted", Vec::new(), provider.clone());
    let result = search_conversation(
        &conversation,
        or_group(vec![term_entry("alice")]),
        None,
        &SearchOptions {
            max_message_matches: Some(10),
            threshold_score: Some(0.0),
            ..Default::default()
        },
        Some("greeting"),
    )
    .await
    .unwrap();
    assert!(!result.knowledge_matches.is_empty());
    assert!(!result.message_matches.is_empty());
}
