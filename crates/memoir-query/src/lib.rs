//! # Memoir Query
//!
//! The query half of the Memoir engine: the search-term algebra, the
//! compiled operator plan, the executor, and the compilation of
//! natural-language structured queries into runnable searches.

pub mod algebra;
pub mod collections;
pub mod compiler;
pub mod ops;
pub mod search;
pub mod searchlang;
pub mod searchlib;

pub use algebra::{
    BooleanOp, PropertyNameTerm, PropertySearchTerm, SearchTerm, SearchTermGroup,
    SearchTermGroupEntry, WhenFilter, WILDCARD,
};
pub use collections::{
    Match, MatchAccumulator, MessageAccumulator, PropertyTermSet, SemanticRefAccumulator,
    TermSet, TextRangeCollection, TextRangesInScope,
};
pub use compiler::QueryCompiler;
pub use ops::{
    KnowledgeExpr, MessageExpr, MessageMatchExpr, QueryEvalContext, ScopeExpr, SemanticRefExpr,
    SemanticRefPredicate, TextRangeSelector,
};
pub use search::{
    run_search_query, search_conversation, search_conversation_knowledge,
    ConversationSearchResult, SearchOptions, SearchQueryExpr, SearchSelectExpr,
    SemanticRefSearchResult,
};
pub use searchlang::{
    compile_search_query, ActionTerm, DateTimeRange, EntityTerm, EntityTermList, FacetTerm,
    LanguageQueryCompileOptions, LanguageSearchFilter, SearchExpr, SearchFilter, SearchQuery,
    SearchQueryCompiler, VerbsTerm,
};
