use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Corrupt similarity index: {0}")]
    CorruptIndex(String),

    #[error("Translation unavailable: {0}")]
    TranslationUnavailable(String),

    #[error("Unsafe query: {0}")]
    UnsafeQuery(String),

    #[error("Query timed out after {timeout_ms}ms: {query}")]
    QueryTimeout { timeout_ms: u64, query: String },

    #[error("Query execution error: {message} (query: {query})")]
    QueryExecution { query: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Only the generative call is worth repeating with identical inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TranslationUnavailable(_))
    }

    /// Message safe to show to the person who asked the question.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::TranslationUnavailable(_) => {
                "The query service is temporarily unavailable. Please try again.".to_string()
            }
            EngineError::UnsafeQuery(_) => {
                "Sorry, I could not understand the request safely. Try rephrasing the question."
                    .to_string()
            }
            EngineError::QueryTimeout { .. } => {
                "The query took too long to run. Try narrowing the region, time range or float."
                    .to_string()
            }
            EngineError::QueryExecution { .. } => {
                "The database could not run the generated query.".to_string()
            }
            other => format!("Internal error: {}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_translation_failures_are_retryable() {
        assert!(EngineError::TranslationUnavailable("503".into()).is_retryable());
        assert!(!EngineError::UnsafeQuery("DROP".into()).is_retryable());
        assert!(!EngineError::QueryTimeout {
            timeout_ms: 10,
            query: "SELECT 1".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_unsafe_query_user_message() {
        let msg = EngineError::UnsafeQuery("multiple statements".into()).user_message();
        assert!(msg.contains("could not understand the request safely"));
        assert!(!msg.contains("multiple statements"));
    }
}
