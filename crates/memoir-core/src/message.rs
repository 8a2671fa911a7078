//! Conversation messages and their metadata-derived knowledge.

use serde::{Deserialize, Serialize};

use crate::knowledge::{
    Action, ConcreteEntity, Facet, FacetValue, KnowledgeResponse, VerbTense, NONE_ENTITY,
};

/// The atomic ingested unit: an ordered sequence of short text chunks, an
/// optional RFC 3339 timestamp, string tags, and domain metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub text_chunks: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub metadata: MessageMeta,
}

impl ConversationMessage {
    pub fn new(text_chunks: Vec<String>, metadata: MessageMeta) -> Self {
        Self {
            text_chunks,
            tags: Vec::new(),
            timestamp: None,
            metadata,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Knowledge derivable from the message metadata alone, without any
    /// model call.
    pub fn get_knowledge(&self) -> KnowledgeResponse {
        self.metadata.get_knowledge()
    }

    /// Total character count across chunks, used for answer budgets.
    pub fn char_count(&self) -> usize {
        self.text_chunks.iter().map(|c| c.chars().count()).sum()
    }
}

/// Domain-specific message metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessageMeta {
    #[default]
    None,
    /// A spoken turn in a transcript (podcast, meeting recording).
    Transcript {
        speaker: Option<String>,
        #[serde(default)]
        listeners: Vec<String>,
    },
    /// An email message.
    Email {
        sender: String,
        #[serde(default)]
        recipients: Vec<String>,
        #[serde(default)]
        cc: Vec<String>,
        #[serde(default)]
        bcc: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
}

impl MessageMeta {
    /// Who produced this message, if known.
    pub fn source(&self) -> Option<&str> {
        match self {
            MessageMeta::None => None,
            MessageMeta::Transcript { speaker, .. } => speaker.as_deref(),
            MessageMeta::Email { sender, .. } => Some(sender.as_str()),
        }
    }

    pub fn get_knowledge(&self) -> KnowledgeResponse {
        match self {
            MessageMeta::None => KnowledgeResponse::default(),
            MessageMeta::Transcript { speaker, listeners } => {
                transcript_knowledge(speaker.as_deref(), listeners)
            }
            MessageMeta::Email {
                sender,
                recipients,
                cc,
                bcc,
                subject,
            } => email_knowledge(sender, recipients, cc, bcc, subject.as_deref()),
        }
    }
}

/// Speaker and listeners become person entities; each speaker/listener
/// pair becomes a past-tense `say` action.
fn transcript_knowledge(speaker: Option<&str>, listeners: &[String]) -> KnowledgeResponse {
    let Some(speaker) = speaker else {
        return KnowledgeResponse::default();
    };
    let mut entities = vec![ConcreteEntity::new(speaker, vec!["person".into()])];
    entities.extend(
        listeners
            .iter()
            .map(|listener| ConcreteEntity::new(listener.clone(), vec!["person".into()])),
    );
    let actions = listeners
        .iter()
        .map(|listener| {
            Action::new(
                vec!["say".into()],
                VerbTense::Past,
                speaker,
                listener.clone(),
                NONE_ENTITY,
            )
        })
        .collect();
    KnowledgeResponse {
        entities,
        actions,
        inverse_actions: Vec::new(),
        topics: Vec::new(),
    }
}

/// Addresses become person/alias entities; each sender/recipient pair
/// becomes a `send` action with a `receive` inverse; the subject becomes
/// a topic.
fn email_knowledge(
    sender: &str,
    recipients: &[String],
    cc: &[String],
    bcc: &[String],
    subject: Option<&str>,
) -> KnowledgeResponse {
    let mut entities = Vec::new();
    entities.extend(address_entities(sender));
    for address in recipients.iter().chain(cc).chain(bcc) {
        entities.extend(address_entities(address));
    }
    entities.push(ConcreteEntity::new("email", vec!["message".into()]));

    let mut actions = Vec::new();
    let mut inverse_actions = Vec::new();
    for recipient in recipients {
        actions.push(Action::new(
            vec!["send".into()],
            VerbTense::Past,
            sender,
            recipient.clone(),
            NONE_ENTITY,
        ));
        inverse_actions.push(Action::new(
            vec!["receive".into()],
            VerbTense::Past,
            recipient.clone(),
            sender,
            NONE_ENTITY,
        ));
    }

    KnowledgeResponse {
        entities,
        actions,
        inverse_actions,
        topics: subject.map(|s| vec![s.to_string()]).unwrap_or_default(),
    }
}

/// Entities for one address string. `Jane Doe <jane@example.com>` yields a
/// person entity faceted with the address plus an alias entity for the
/// bare address.
fn address_entities(address: &str) -> Vec<ConcreteEntity> {
    let (display_name, bare_address) = split_address(address);
    let mut entities = Vec::new();
    if let Some(name) = display_name {
        let mut entity = ConcreteEntity::new(name, vec!["person".into()]);
        if let Some(addr) = &bare_address {
            entity.facets = Some(vec![Facet {
                name: "email_address".into(),
                value: FacetValue::String(addr.clone()),
            }]);
        }
        entities.push(entity);
    }
    if let Some(addr) = bare_address {
        entities.push(ConcreteEntity::new(
            addr,
            vec!["email_address".into(), "alias".into()],
        ));
    }
    entities
}

fn split_address(address: &str) -> (Option<String>, Option<String>) {
    let address = address.trim();
    if let (Some(open), Some(close)) = (address.find('<'), address.rfind('>')) {
        if open < close {
            let name = address[..open].trim().trim_matches('"');
            let bare = address[open + 1..close].trim();
            return (
                (!name.is_empty()).then(|| name.to_string()),
                (!bare.is_empty()).then(|| bare.to_string()),
            );
        }
    }
    if address.contains('@') {
        (None, Some(address.to_string()))
    } else if address.is_empty() {
        (None, None)
    } else {
        (Some(address.to_string()), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::NONE_ENTITY;

    #[test]
    fn transcript_metadata_yields_entities_and_say_actions() {
        let meta = MessageMeta::Transcript {
            speaker: Some("Alice".into()),
            listeners: vec!["Bob".into()],
        };
        let knowledge = meta.get_knowledge();
        assert_eq!(knowledge.entities.len(), 2);
        assert_eq!(knowledge.entities[0].name, "Alice");
        assert_eq!(knowledge.entities[0].types, vec!["person"]);
        assert_eq!(knowledge.actions.len(), 1);
        let action = &knowledge.actions[0];
        assert_eq!(action.verbs, vec!["say"]);
        assert_eq!(action.subject_entity_name, "Alice");
        assert_eq!(action.object_entity_name, "Bob");
        assert_eq!(action.indirect_object_entity_name, NONE_ENTITY);
    }

    #[test]
    fn transcript_without_speaker_yields_nothing() {
        let meta = MessageMeta::Transcript {
            speaker: None,
            listeners: vec!["Bob".into()],
        };
        assert!(meta.get_knowledge().is_empty());
    }

    #[test]
    fn email_metadata_yields_send_and_receive() {
        let meta = MessageMeta::Email {
            sender: "Jane Doe <jane@example.com>".into(),
            recipients: vec!["bob@example.com".into()],
            cc: vec![],
            bcc: vec![],
            subject: Some("Budget review".into()),
        };
        let knowledge = meta.get_knowledge();
        assert!(knowledge.entities.iter().any(|e| e.name == "Jane Doe"));
        assert!(knowledge.entities.iter().any(|e| e.name == "bob@example.com"));
        assert_eq!(knowledge.actions[0].verbs, vec!["send"]);
        assert_eq!(knowledge.inverse_actions[0].verbs, vec!["receive"]);
        assert_eq!(knowledge.topics, vec!["Budget review"]);
    }

    #[test]
    fn address_splitting_handles_display_names() {
        assert_eq!(
            split_address("Jane Doe <jane@example.com>"),
            (Some("Jane Doe".into()), Some("jane@example.com".into()))
        );
        assert_eq!(
            split_address("jane@example.com"),
            (None, Some("jane@example.com".into()))
        );
        assert_eq!(split_address("Jane"), (Some("Jane".into()), None));
    }
}
