//! Error types for Memoir components

use thiserror::Error;

/// Standard error type for all Memoir components.
///
/// Variants mirror the failure surfaces of the engine: bad caller input,
/// LLM translation, knowledge extraction, embedding calls, internal
/// consistency, and the storage layer. Network retries happen below this
/// type; an error that reaches the caller is final.
#[derive(Debug, Error)]
pub enum MemoirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("query translation failed: {0}")]
    Translation(String),

    #[error("knowledge extraction failed: {0}")]
    Extraction(String),

    #[error("embedding request failed: {0}")]
    Embedding(String),

    /// A lookup referenced an ordinal absent from its collection. This is a
    /// programming error; callers must not attempt recovery.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MemoirError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

/// Result type alias for convenience.
pub type MemoirResult<T> = Result<T, MemoirError>;
