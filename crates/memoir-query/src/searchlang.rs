//! Natural-language query structures and their compilation into
//! search-term groups (pipeline stage 2). Stage 1, the LLM translation of
//! user text into [`SearchQuery`], lives with the language-model clients;
//! this module is pure.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use memoir_core::{properties, DateRange, KnowledgeKind};

use crate::algebra::{
    BooleanOp, PropertyNameTerm, PropertySearchTerm, SearchTerm, SearchTermGroup,
    SearchTermGroupEntry, WhenFilter, WILDCARD,
};
use crate::collections::PropertyTermSet;
use crate::search::{SearchQueryExpr, SearchSelectExpr};

/// A facet constraint on an entity; `*` matches any name or value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetTerm {
    pub facet_name: String,
    pub facet_value: String,
}

/// A specific, tangible person, place, institution or thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTerm {
    pub name: String,
    #[serde(default)]
    pub is_name_pronoun: Option<bool>,
    #[serde(default, rename = "type")]
    pub types: Option<Vec<String>>,
    #[serde(default)]
    pub facets: Option<Vec<FacetTerm>>,
}

impl EntityTerm {
    fn is_pronoun(&self) -> bool {
        self.is_name_pronoun.unwrap_or(false)
    }
}

/// The verbs of an action phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbsTerm {
    pub words: Vec<String>,
    #[serde(default)]
    pub tense: Option<String>,
}

/// Entities filling an action role; `"*"` means any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityTermList {
    Wildcard(String),
    Entities(Vec<EntityTerm>),
}

impl EntityTermList {
    fn entities(&self) -> Option<&[EntityTerm]> {
        match self {
            EntityTermList::Entities(entities) => Some(entities),
            EntityTermList::Wildcard(_) => None,
        }
    }
}

/// An interaction between entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionTerm {
    #[serde(default)]
    pub action_verbs: Option<VerbsTerm>,
    #[serde(default)]
    pub actor_entities: Option<EntityTermList>,
    #[serde(default)]
    pub target_entities: Option<EntityTermList>,
    #[serde(default)]
    pub additional_entities: Option<EntityTermList>,
    /// True when the phrase asks for information about entities rather
    /// than interactions between them.
    #[serde(default)]
    pub is_informational: bool,
}

/// Calendar date in the translator's wire form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateSpec {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TimeSpec {
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub seconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeSpec {
    pub date: DateSpec,
    #[serde(default)]
    pub time: Option<TimeSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeRange {
    pub start_date: DateTimeSpec,
    #[serde(default)]
    pub stop_date: Option<DateTimeSpec>,
}

/// One filter of a search expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilter {
    #[serde(default)]
    pub action_search_term: Option<ActionTerm>,
    #[serde(default)]
    pub entity_search_terms: Option<Vec<EntityTerm>>,
    #[serde(default)]
    pub search_terms: Option<Vec<String>>,
    #[serde(default)]
    pub time_range: Option<DateTimeRange>,
}

/// One search required by the user request, already rewritten to stand
/// alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchExpr {
    pub rewritten_query: String,
    #[serde(default)]
    pub filters: Vec<SearchFilter>,
}

/// The translator's structured output: one expression per search the
/// user request needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub search_expressions: Vec<SearchExpr>,
}

/// Filter options that apply to the whole language search.
#[derive(Debug, Clone, Default)]
pub struct LanguageSearchFilter {
    pub knowledge_kind: Option<KnowledgeKind>,
    pub thread_description: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Compile-time switches.
#[derive(Debug, Clone)]
pub struct LanguageQueryCompileOptions {
    /// Disable fuzzy matching when applying scope.
    pub exact_scope: bool,
    /// Include verbs in scope-defining terms.
    pub verb_scope: bool,
    /// Disable scope selection entirely.
    pub apply_scope: bool,
}

impl Default for LanguageQueryCompileOptions {
    fn default() -> Self {
        Self {
            exact_scope: false,
            verb_scope: true,
            apply_scope: true,
        }
    }
}

/// Compile a structured query into runnable search expressions.
pub fn compile_search_query(
    query: &SearchQuery,
    options: &LanguageQueryCompileOptions,
    lang_filter: Option<&LanguageSearchFilter>,
) -> Vec<SearchQueryExpr> {
    let mut compiler = SearchQueryCompiler::new(options.clone(), lang_filter.cloned());
    query
        .search_expressions
        .iter()
        .map(|expr| compiler.compile_search_expr(expr))
        .collect()
}

/// Compiles the translator's structured query into search-term groups and
/// when-filters. Stateful across one query; create one per query.
pub struct SearchQueryCompiler {
    options: LanguageQueryCompileOptions,
    lang_filter: LanguageSearchFilter,
    entity_terms_added: PropertyTermSet,
    dedupe: bool,
}

impl SearchQueryCompiler {
    pub fn new(
        options: LanguageQueryCompileOptions,
        lang_filter: Option<LanguageSearchFilter>,
    ) -> Self {
        Self {
            options,
            lang_filter: lang_filter.unwrap_or_default(),
            entity_terms_added: PropertyTermSet::new(),
            dedupe: true,
        }
    }

    pub fn compile_search_expr(&mut self, expr: &SearchExpr) -> SearchQueryExpr {
        let select_expressions = expr
            .filters
            .iter()
            .map(|filter| self.compile_search_filter(filter))
            .collect();
        SearchQueryExpr {
            select_expressions,
            raw_query: Some(expr.rewritten_query.clone()),
        }
    }

    pub fn compile_search_filter(&mut self, filter: &SearchFilter) -> SearchSelectExpr {
        let search_term_group = self.compile_term_group(filter);
        let when = self.compile_when(filter);
        SearchSelectExpr {
            search_term_group,
            when,
        }
    }

    fn compile_term_group(&mut self, filter: &SearchFilter) -> SearchTermGroup {
        let mut term_group = SearchTermGroup::new(BooleanOp::Or);
        self.entity_terms_added.clear();
        if let Some(entity_terms) = &filter.entity_search_terms {
            self.compile_entity_terms(entity_terms, &mut term_group);
        }
        if let Some(action_term) = &filter.action_search_term {
            self.compile_action_term_as_search_terms(action_term, &mut term_group);
        }
        if let Some(search_terms) = &filter.search_terms {
            for text in search_terms {
                self.add_search_term_to_group(text, &mut term_group);
            }
        }
        if term_group.is_empty() {
            // A summary request: match every topic.
            term_group.terms.push(property_entry(
                properties::TOPIC,
                SearchTerm::new(WILDCARD),
            ));
        }
        term_group
    }

    fn compile_when(&mut self, filter: &SearchFilter) -> Option<WhenFilter> {
        let mut when: Option<WhenFilter> = None;
        if self.options.apply_scope {
            if let Some(action_term) = &filter.action_search_term {
                if self.should_add_scope(action_term) {
                    let scope_terms = self.compile_scope(action_term);
                    if !scope_terms.is_empty() {
                        when.get_or_insert_with(WhenFilter::default)
                            .scope_defining_terms = Some(scope_terms);
                    }
                }
            }
        }
        if let Some(time_range) = &filter.time_range {
            when.get_or_insert_with(WhenFilter::default).date_range =
                Some(date_range_from_wire(time_range));
        }
        if self.lang_filter.knowledge_kind.is_some()
            || self.lang_filter.tags.is_some()
            || self.lang_filter.thread_description.is_some()
        {
            let when = when.get_or_insert_with(WhenFilter::default);
            when.knowledge_kind = self.lang_filter.knowledge_kind;
            when.tags = self.lang_filter.tags.clone();
            when.thread_description = self.lang_filter.thread_description.clone();
        }
        when
    }

    /// Entity terms each become an or_max group over their property
    /// constraints, plus a topic echo of the entity name.
    fn compile_entity_terms(&mut self, entity_terms: &[EntityTerm], group: &mut SearchTermGroup) {
        let save_dedupe = self.dedupe;
        self.dedupe = false;
        for entity in entity_terms {
            let mut or_max = SearchTermGroup::new(BooleanOp::OrMax);
            self.add_entity_term_to_group(entity, &mut or_max);
            group.terms.push(optimize_or_max(or_max));
        }
        self.dedupe = save_dedupe;
        for entity in entity_terms {
            self.add_entity_name_to_group(entity, properties::TOPIC, group, false);
            if let Some(facets) = &entity.facets {
                for facet in facets {
                    if facet.facet_value != WILDCARD && !facet.facet_value.is_empty() {
                        self.add_property_term_to_group(
                            properties::TOPIC,
                            &facet.facet_value,
                            group,
                            false,
                        );
                    }
                }
            }
        }
    }

    /// An action term used for selection (not scope): verbs echo as
    /// topics and every participating entity becomes a plain search term.
    fn compile_action_term_as_search_terms(
        &mut self,
        action_term: &ActionTerm,
        group: &mut SearchTermGroup,
    ) {
        if let Some(verbs) = &action_term.action_verbs {
            for verb in &verbs.words {
                self.add_property_term_to_group(properties::TOPIC, verb, group, false);
            }
        }
        for entities in [
            &action_term.actor_entities,
            &action_term.target_entities,
            &action_term.additional_entities,
        ]
        .into_iter()
        .flatten()
        {
            if let Some(entities) = entities.entities() {
                for entity in entities {
                    self.add_entity_term_as_search_terms(entity, group);
                }
            }
        }
    }

    /// Scope-defining terms: subject (+ verbs) and, per target, the
    /// object read either as an action object or as an entity.
    fn compile_scope(&mut self, action_term: &ActionTerm) -> SearchTermGroup {
        let save_dedupe = self.dedupe;
        self.dedupe = false;
        let term_group = self.compile_action_term(action_term, true, self.options.verb_scope);
        self.dedupe = save_dedupe;
        term_group
    }

    fn compile_action_term(
        &mut self,
        action_term: &ActionTerm,
        use_and: bool,
        include_verbs: bool,
    ) -> SearchTermGroup {
        if let Some(targets) = action_term
            .target_entities
            .as_ref()
            .and_then(|t| t.entities())
        {
            let mut term_group =
                SearchTermGroup::new(if use_and { BooleanOp::And } else { BooleanOp::Or });
            for target in targets {
                let mut svo_group = if include_verbs {
                    self.compile_subject_and_verb(action_term)
                } else {
                    self.compile_subject(action_term)
                };
                let object_group = self.compile_object(target);
                if !object_group.is_empty() {
                    svo_group
                        .terms
                        .push(SearchTermGroupEntry::Group(object_group));
                }
                term_group.terms.push(SearchTermGroupEntry::Group(svo_group));
            }
            if term_group.terms.len() == 1 {
                match term_group.terms.pop() {
                    Some(SearchTermGroupEntry::Group(inner)) => return inner,
                    Some(entry) => term_group.terms.push(entry),
                    None => {}
                }
            }
            term_group
        } else if include_verbs {
            self.compile_subject_and_verb(action_term)
        } else {
            self.compile_subject(action_term)
        }
    }

    fn compile_subject_and_verb(&mut self, action_term: &ActionTerm) -> SearchTermGroup {
        let mut group = SearchTermGroup::new(BooleanOp::And);
        self.add_subject_to_group(action_term, &mut group);
        if let Some(verbs) = &action_term.action_verbs {
            for verb in &verbs.words {
                self.add_property_term_to_group(properties::VERB, verb, &mut group, false);
            }
        }
        group
    }

    fn compile_subject(&mut self, action_term: &ActionTerm) -> SearchTermGroup {
        let mut group = SearchTermGroup::new(BooleanOp::And);
        self.add_subject_to_group(action_term, &mut group);
        group
    }

    fn add_subject_to_group(&mut self, action_term: &ActionTerm, group: &mut SearchTermGroup) {
        if let Some(actors) = action_term
            .actor_entities
            .as_ref()
            .and_then(|a| a.entities())
        {
            for actor in actors {
                self.add_entity_name_to_group(actor, properties::SUBJECT, group, false);
            }
        }
    }

    /// A target names either the object of an action, an entity, or a
    /// topic.
    fn compile_object(&mut self, entity: &EntityTerm) -> SearchTermGroup {
        let mut group = SearchTermGroup::new(BooleanOp::Or);
        self.add_entity_name_to_group(entity, properties::OBJECT, &mut group, false);
        self.add_entity_name_to_group(
            entity,
            properties::ENTITY_NAME,
            &mut group,
            self.options.exact_scope,
        );
        self.add_entity_name_to_group(
            entity,
            properties::TOPIC,
            &mut group,
            self.options.exact_scope,
        );
        group
    }

    fn add_entity_term_as_search_terms(
        &mut self,
        entity: &EntityTerm,
        group: &mut SearchTermGroup,
    ) {
        if entity.is_pronoun() {
            return;
        }
        self.add_search_term_to_group(&entity.name, group);
        if let Some(types) = &entity.types {
            for entity_type in types {
                self.add_search_term_to_group(entity_type, group);
            }
        }
        if let Some(facets) = &entity.facets {
            for facet in facets {
                self.add_search_term_to_group(&facet.facet_name, group);
                self.add_search_term_to_group(&facet.facet_value, group);
            }
        }
    }

    fn add_entity_term_to_group(&mut self, entity: &EntityTerm, group: &mut SearchTermGroup) {
        self.add_property_term_to_group(properties::ENTITY_NAME, &entity.name, group, false);
        if let Some(types) = &entity.types {
            for entity_type in types {
                self.add_property_term_to_group(properties::ENTITY_TYPE, entity_type, group, false);
            }
        }
        if let Some(facets) = &entity.facets {
            for facet in facets {
                let name_is_wildcard = facet.facet_name == WILDCARD;
                let value_is_wildcard = facet.facet_value == WILDCARD;
                match (name_is_wildcard, value_is_wildcard) {
                    (false, false) => self.add_facet_term_to_group(
                        &facet.facet_name,
                        &facet.facet_value,
                        group,
                    ),
                    (false, true) => self.add_property_term_to_group(
                        properties::FACET_NAME,
                        &facet.facet_name,
                        group,
                        false,
                    ),
                    (true, false) => self.add_property_term_to_group(
                        properties::FACET_VALUE,
                        &facet.facet_value,
                        group,
                        false,
                    ),
                    (true, true) => {}
                }
            }
        }
    }

    fn add_entity_name_to_group(
        &mut self,
        entity: &EntityTerm,
        property_name: &str,
        group: &mut SearchTermGroup,
        exact_match_value: bool,
    ) {
        if !entity.is_pronoun() {
            self.add_property_term_to_group(property_name, &entity.name, group, exact_match_value);
        }
    }

    fn add_search_term_to_group(&mut self, text: &str, group: &mut SearchTermGroup) {
        if self.is_searchable_string(text) {
            group
                .terms
                .push(SearchTermGroupEntry::Term(SearchTerm::new(text)));
        }
    }

    /// A custom facet constraint, e.g. `color(blue)`.
    fn add_facet_term_to_group(&mut self, name: &str, value: &str, group: &mut SearchTermGroup) {
        if !self.is_searchable_string(name) || !self.is_searchable_string(value) {
            return;
        }
        group
            .terms
            .push(SearchTermGroupEntry::Property(PropertySearchTerm {
                property_name: PropertyNameTerm::Facet(SearchTerm::new(name)),
                property_value: SearchTerm::new(value),
            }));
    }

    fn add_property_term_to_group(
        &mut self,
        property_name: &str,
        property_value: &str,
        group: &mut SearchTermGroup,
        exact_match_value: bool,
    ) {
        if !self.is_searchable_string(property_name)
            || !self.is_searchable_string(property_value)
            || self.is_noise_term(property_value)
        {
            return;
        }
        // Skip terms already added to this group.
        if self.dedupe && self.entity_terms_added.has(property_name, property_value) {
            return;
        }
        let property_value_term = if exact_match_value {
            SearchTerm::exact(property_value)
        } else {
            SearchTerm::new(property_value)
        };
        group.terms.push(property_entry(
            property_name,
            property_value_term,
        ));
        self.entity_terms_added.add(property_name, property_value);
    }

    fn is_searchable_string(&self, value: &str) -> bool {
        !value.is_empty() && value != WILDCARD
    }

    fn is_noise_term(&self, value: &str) -> bool {
        matches!(
            value.to_lowercase().as_str(),
            "thing" | "object" | "concept" | "idea" | "entity"
        )
    }

    fn should_add_scope(&self, action_term: &ActionTerm) -> bool {
        if action_term.is_informational {
            return false;
        }
        if self.options.exact_scope {
            return true;
        }
        // Without a concrete subject there is nothing to scope by.
        action_term
            .actor_entities
            .as_ref()
            .and_then(|a| a.entities())
            .is_some_and(|entities| !entities.is_empty())
    }
}

fn property_entry(name: &str, value: SearchTerm) -> SearchTermGroupEntry {
    let property_name = if properties::is_known_property(name) {
        PropertyNameTerm::Known(name.to_string())
    } else {
        PropertyNameTerm::Facet(SearchTerm::new(name))
    };
    SearchTermGroupEntry::Property(PropertySearchTerm {
        property_name,
        property_value: value,
    })
}

fn optimize_or_max(group: SearchTermGroup) -> SearchTermGroupEntry {
    if group.terms.len() == 1 {
        group.terms.into_iter().next().unwrap()
    } else {
        SearchTermGroupEntry::Group(group)
    }
}

/// Convert the translator's wire date range into a half-open UTC range.
pub fn date_range_from_wire(range: &DateTimeRange) -> DateRange {
    DateRange {
        start: datetime_from_wire(&range.start_date),
        end: range.stop_date.as_ref().map(datetime_from_wire),
    }
}

fn datetime_from_wire(spec: &DateTimeSpec) -> chrono::DateTime<Utc> {
    let time = spec.time.unwrap_or_default();
    Utc.with_ymd_and_hms(
        spec.date.year,
        spec.date.month,
        spec.date.day,
        time.hour,
        time.minute,
        time.seconds,
    )
    .single()
    .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str) -> EntityTerm {
        EntityTerm {
            name: name.into(),
            is_name_pronoun: None,
            types: None,
            facets: None,
        }
    }

    #[test]
    fn empty_filter_compiles_to_topic_wildcard() {
        let mut compiler = SearchQueryCompiler::new(Default::default(), None);
        let group = compiler.compile_term_group(&SearchFilter::default());
        assert_eq!(group.terms.len(), 1);
        match &group.terms[0] {
            SearchTermGroupEntry::Property(pst) => {
                assert_eq!(
                    pst.property_name,
                    PropertyNameTerm::Known("topic".to_string())
                );
                assert!(pst.property_value.is_wildcard());
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn entity_terms_expand_to_property_groups_and_topic_echo() {
        let mut compiler = SearchQueryCompiler::new(Default::default(), None);
        let filter = SearchFilter {
            entity_search_terms: Some(vec![EntityTerm {
                name: "Bach".into(),
                is_name_pronoun: None,
                types: Some(vec!["composer".into()]),
                facets: None,
            }]),
            ..Default::default()
        };
        let group = compiler.compile_term_group(&filter);
        // One or_max group (name + type) and one topic echo.
        assert_eq!(group.terms.len(), 2);
        assert!(matches!(group.terms[0], SearchTermGroupEntry::Group(_)));
    }

    #[test]
    fn informational_actions_do_not_scope() {
        let mut compiler = SearchQueryCompiler::new(Default::default(), None);
        let filter = SearchFilter {
            action_search_term: Some(ActionTerm {
                actor_entities: Some(EntityTermList::Entities(vec![entity("alice")])),
                is_informational: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(compiler.compile_when(&filter).is_none());
    }

    #[test]
    fn actions_with_actors_scope_by_subject_and_verb() {
        let mut compiler = SearchQueryCompiler::new(Default::default(), None);
        let filter = SearchFilter {
            action_search_term: Some(ActionTerm {
                action_verbs: Some(VerbsTerm {
                    words: vec!["say".into()],
                    tense: None,
                }),
                actor_entities: Some(EntityTermList::Entities(vec![entity("alice")])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let when = compiler.compile_when(&filter).unwrap();
        let scope = when.scope_defining_terms.unwrap();
        assert_eq!(scope.boolean_op, BooleanOp::And);
        assert_eq!(scope.terms.len(), 2);
    }

    #[test]
    fn noise_terms_are_dropped() {
        let mut compiler = SearchQueryCompiler::new(Default::default(), None);
        let mut group = SearchTermGroup::new(BooleanOp::Or);
        compiler.add_property_term_to_group("name", "thing", &mut group, false);
        assert!(group.is_empty());
    }

    #[test]
    fn wire_dates_convert_to_utc_ranges() {
        let range = DateTimeRange {
            start_date: DateTimeSpec {
                date: DateSpec {
                    year: 2024,
                    month: 1,
                    day: 1,
                },
                time: Some(TimeSpec {
                    hour: 1,
                    minute: 0,
                    seconds: 0,
                }),
            },
            stop_date: Some(DateTimeSpec {
                date: DateSpec {
                    year: 2024,
                    month: 1,
                    day: 1,
                },
                time: Some(TimeSpec {
                    hour: 3,
                    minute: 0,
                    seconds: 0,
                }),
            }),
        };
        let date_range = date_range_from_wire(&range);
        assert_eq!(
            date_range.start,
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap()
        );
        assert_eq!(
            date_range.end,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap())
        );
    }

    #[test]
    fn search_query_wire_form_deserializes() {
        let json = r#"{
            "searchExpressions": [{
                "rewrittenQuery": "What did Alice say about the budget?",
                "filters": [{
                    "actionSearchTerm": {
                        "actionVerbs": {"words": ["say"], "tense": "Past"},
                        "actorEntities": [{"name": "Alice", "isNamePronoun": false}],
                        "targetEntities": null,
                        "additionalEntities": [{"name": "budget", "isNamePronoun": false}],
                        "isInformational": false
                    },
                    "searchTerms": ["budget"]
                }]
            }]
        }"#;
        let query: SearchQuery = serde_json::from_str(json).unwrap();
        assert_eq!(query.search_expressions.len(), 1);
        let filter = &query.search_expressions[0].filters[0];
        assert!(filter.action_search_term.is_some());
        assert_eq!(filter.search_terms.as_ref().unwrap().len(), 1);
    }
}
