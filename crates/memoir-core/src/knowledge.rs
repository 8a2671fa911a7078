//! Knowledge payload types: entities, actions, topics, and tags extracted
//! from conversation text, plus the extractor contract.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::KnowledgeKind;

/// Sentinel entity name meaning "no entity fills this role".
pub const NONE_ENTITY: &str = "none";

/// An amount with units, e.g. `4 kg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub amount: f64,
    pub units: String,
}

/// Value of a facet or action parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FacetValue {
    Quantity(Quantity),
    Bool(bool),
    Number(f64),
    String(String),
}

impl std::fmt::Display for FacetValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacetValue::Quantity(q) => write!(f, "{} {}", q.amount, q.units),
            FacetValue::Bool(b) => write!(f, "{b}"),
            // Integral values print without a fractional part.
            FacetValue::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                write!(f, "{}", *n as i64)
            }
            FacetValue::Number(n) => write!(f, "{n}"),
            FacetValue::String(s) => write!(f, "{s}"),
        }
    }
}

/// A concise property of an entity, e.g. `color: blue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facet {
    pub name: String,
    pub value: FacetValue,
}

/// A specific, tangible person, place, institution or thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcreteEntity {
    pub name: String,
    /// Entity types such as "person", "book", "instrument". An entity can
    /// have several; each type is a single word.
    #[serde(rename = "type")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facets: Option<Vec<Facet>>,
}

impl ConcreteEntity {
    pub fn new(name: impl Into<String>, types: Vec<String>) -> Self {
        Self {
            name: name.into(),
            types,
            facets: None,
        }
    }
}

/// Grammatical tense of an action's verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerbTense {
    Past,
    Present,
    Future,
}

/// A named action parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedParam {
    pub name: String,
    pub value: FacetValue,
}

/// An action parameter: either a bare word or a name/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionParam {
    NameValue(NamedParam),
    Name(String),
}

/// A verb phrase with subject / object / indirect-object entity roles.
/// Role names equal to [`NONE_ENTITY`] mean the role is unfilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub verbs: Vec<String>,
    pub verb_tense: VerbTense,
    pub subject_entity_name: String,
    pub object_entity_name: String,
    pub indirect_object_entity_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<ActionParam>>,
    /// A facet of the subject implied by the action, e.g. hobbies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_entity_facet: Option<Facet>,
}

impl Action {
    pub fn new(
        verbs: Vec<String>,
        verb_tense: VerbTense,
        subject: impl Into<String>,
        object: impl Into<String>,
        indirect_object: impl Into<String>,
    ) -> Self {
        Self {
            verbs,
            verb_tense,
            subject_entity_name: subject.into(),
            object_entity_name: object.into(),
            indirect_object_entity_name: indirect_object.into(),
            params: None,
            subject_entity_facet: None,
        }
    }

    /// Verbs joined by single spaces, the form indexed as a term.
    pub fn joined_verbs(&self) -> String {
        self.verbs.join(" ")
    }
}

/// A conversational topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub text: String,
}

/// A structural tag on a message or range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub text: String,
}

/// The knowledge payload of a semantic reference. The wire form carries the
/// variant in `knowledgeType` and the payload in `knowledge`, matching the
/// persisted conversation format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "knowledgeType", content = "knowledge", rename_all = "lowercase")]
pub enum Knowledge {
    Entity(ConcreteEntity),
    Action(Action),
    Topic(Topic),
    Tag(Tag),
}

impl Knowledge {
    pub fn kind(&self) -> KnowledgeKind {
        match self {
            Knowledge::Entity(_) => KnowledgeKind::Entity,
            Knowledge::Action(_) => KnowledgeKind::Action,
            Knowledge::Topic(_) => KnowledgeKind::Topic,
            Knowledge::Tag(_) => KnowledgeKind::Tag,
        }
    }
}

/// Everything an extractor found in one piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeResponse {
    #[serde(default)]
    pub entities: Vec<ConcreteEntity>,
    /// Subject and object names must name entities from `entities`.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Reverse readings of actions, e.g. `A gives to B` -> `B receives
    /// from A`. Indexed exactly like `actions`.
    #[serde(default)]
    pub inverse_actions: Vec<Action>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl KnowledgeResponse {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.actions.is_empty()
            && self.inverse_actions.is_empty()
            && self.topics.is_empty()
    }
}

/// Extracts structured knowledge from conversation text. Implementations
/// call an LLM and must retry transient failures internally; an error from
/// `extract` aborts the batch it belongs to.
#[async_trait]
pub trait KnowledgeExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<KnowledgeResponse>;

    /// Extract a batch of chunks in one round trip where the backend
    /// supports it. The default issues one call per chunk.
    async fn extract_batch(&self, texts: &[String]) -> Result<Vec<KnowledgeResponse>> {
        let mut responses = Vec::with_capacity(texts.len());
        for text in texts {
            responses.push(self.extract(text).await?);
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facet_value_formats_integral_numbers_without_fraction() {
        assert_eq!(FacetValue::Number(4.0).to_string(), "4");
        assert_eq!(FacetValue::Number(4.5).to_string(), "4.5");
        assert_eq!(
            FacetValue::Quantity(Quantity {
                amount: 4.0,
                units: "kg".into()
            })
            .to_string(),
            "4 kg"
        );
    }

    #[test]
    fn knowledge_round_trips_with_type_tag() {
        let knowledge = Knowledge::Entity(ConcreteEntity::new("alice", vec!["person".into()]));
        let json = serde_json::to_value(&knowledge).unwrap();
        assert_eq!(json["knowledgeType"], "entity");
        assert_eq!(json["knowledge"]["name"], "alice");
        let back: Knowledge = serde_json::from_value(json).unwrap();
        assert_eq!(back, knowledge);
    }

    #[test]
    fn facet_value_deserializes_each_shape() {
        let v: FacetValue = serde_json::from_str("\"blue\"").unwrap();
        assert_eq!(v, FacetValue::String("blue".into()));
        let v: FacetValue = serde_json::from_str("4.5").unwrap();
        assert_eq!(v, FacetValue::Number(4.5));
        let v: FacetValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, FacetValue::Bool(true));
        let v: FacetValue = serde_json::from_str(r#"{"amount": 4, "units": "kg"}"#).unwrap();
        assert!(matches!(v, FacetValue::Quantity(_)));
    }
}
