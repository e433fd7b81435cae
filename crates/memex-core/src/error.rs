//! Error taxonomy shared by the indexing pipeline and the query engine.
//!
//! Every fallible core operation returns [`MemexError`]. The variants map
//! onto how the caller should react:
//!
//! | Variant | Reaction |
//! |---------|----------|
//! | [`Configuration`](MemexError::Configuration) | fatal, surfaced immediately |
//! | [`TransientProvider`](MemexError::TransientProvider) / [`Timeout`](MemexError::Timeout) | retried with backoff |
//! | [`Provider`](MemexError::Provider) | permanent backend failure, not retried |
//! | [`Validation`](MemexError::Validation) | reported to the responsible caller |
//! | [`IndexConsistency`](MemexError::IndexConsistency) | triggers a repair of one document |
//! | [`NotFound`](MemexError::NotFound) | lookup miss |
//! | [`Storage`](MemexError::Storage) | store backend failure |

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemexError {
    /// Missing or invalid setup (unknown provider, missing model, bad sizes).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network or rate-limit failure from an embedding, LLM, or tool backend.
    #[error("{provider} unavailable: {message}")]
    TransientProvider { provider: String, message: String },

    /// A backend rejected the request in a way retrying cannot fix.
    #[error("{provider} error: {message}")]
    Provider { provider: String, message: String },

    /// An external call exceeded its deadline.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    /// Malformed input (tool arguments, chunk sizes, vector dimensions).
    #[error("Validation error: {0}")]
    Validation(String),

    /// An index entry references a chunk that is missing from the vector store.
    #[error("Index entry for chunk {chunk_id} (document {document_id}) has no stored vector")]
    IndexConsistency {
        document_id: String,
        chunk_id: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MemexError>;

impl MemexError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MemexError::TransientProvider { .. } | MemexError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MemexError::transient("openai", "429").is_transient());
        assert!(MemexError::Timeout {
            operation: "embed".into(),
            millis: 10
        }
        .is_transient());
        assert!(!MemexError::provider("openai", "400 bad request").is_transient());
        assert!(!MemexError::configuration("missing model").is_transient());
        assert!(!MemexError::validation("bad args").is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = MemexError::configuration("embedding.model must be set");
        assert_eq!(
            err.to_string(),
            "Configuration error: embedding.model must be set"
        );

        let err = MemexError::IndexConsistency {
            document_id: "d1".into(),
            chunk_id: "c1".into(),
        };
        assert!(err.to_string().contains("c1"));
        assert!(err.to_string().contains("d1"));
    }
}
