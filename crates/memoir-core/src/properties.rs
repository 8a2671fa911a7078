//! Well-known property names used by the property index and structured
//! queries. Arbitrary custom names are also permitted; these are the ones
//! the engine itself writes.

pub const ENTITY_NAME: &str = "name";
pub const ENTITY_TYPE: &str = "type";
pub const FACET_NAME: &str = "facet.name";
pub const FACET_VALUE: &str = "facet.value";
pub const VERB: &str = "verb";
pub const SUBJECT: &str = "subject";
pub const OBJECT: &str = "object";
pub const INDIRECT_OBJECT: &str = "indirectObject";
pub const TAG: &str = "tag";
pub const TOPIC: &str = "topic";

/// All names with a predefined meaning.
pub const KNOWN_PROPERTY_NAMES: &[&str] = &[
    ENTITY_NAME,
    ENTITY_TYPE,
    FACET_NAME,
    FACET_VALUE,
    VERB,
    SUBJECT,
    OBJECT,
    INDIRECT_OBJECT,
    TAG,
    TOPIC,
];

/// Property names whose presence in a query makes the term describe an
/// action, which in turn implies message scoping.
pub const ACTION_PROPERTY_NAMES: &[&str] = &[SUBJECT, VERB, OBJECT, INDIRECT_OBJECT];

pub fn is_known_property(name: &str) -> bool {
    KNOWN_PROPERTY_NAMES.contains(&name)
}

pub fn is_action_property(name: &str) -> bool {
    ACTION_PROPERTY_NAMES.contains(&name)
}
