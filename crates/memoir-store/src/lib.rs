//! # Memoir Store
//!
//! The two storage backends for Memoir conversations — in-memory and
//! SQLite — plus the index builders that populate them from the message
//! stream and extracted knowledge, and the persisted conversation-data
//! file format.

pub mod builders;
pub mod memory;
pub mod propkey;
pub mod serialization;
pub mod sqlite;

pub use builders::{
    add_knowledge_to_semantic_ref_index, add_metadata_to_index, add_to_property_index,
    build_conversation_index, build_message_index, build_property_index,
    build_related_terms_index, build_semantic_ref_index, build_timestamp_index,
    load_bundled_aliases, IndexingCounts,
};
pub use memory::MemoryStorageProvider;
pub use sqlite::SqliteStorageProvider;
