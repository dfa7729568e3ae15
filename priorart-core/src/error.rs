//! Error types for the priorart retrieval core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering text generation, search backends, configuration, and the
//! pipeline itself.

use std::path::PathBuf;

/// Top-level error type returned by the retrieval pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Unusable model output. Absorbed inside the pipeline with a safe default.
    #[error("Generation output rejected: {0}")]
    Parse(#[from] GenerationParseError),

    #[error("Partial retrieval: requested {expected} identifiers, found {found}")]
    PartialRetrieval { found: usize, expected: usize },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error(
        "No relevant documents found ({failed_searches} of {attempted_searches} searches failed)"
    )]
    NoRelevantDocuments {
        failed_searches: usize,
        attempted_searches: usize,
    },

    #[error("Retrieval was cancelled")]
    Cancelled,

    #[error("Retrieval timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Worker task failed: {message}")]
    Worker { message: String },
}

/// Errors from text-generation and embedding providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
}

/// Errors from a dense/sparse search backend.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("Search backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("Search timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding failed: {0}")]
    Embedding(#[from] LlmError),
}

/// Structured generation output that failed validation.
///
/// Never escapes a public entry point: callers absorb it into a logged
/// safe default.
#[derive(Debug, thiserror::Error)]
pub enum GenerationParseError {
    #[error("Output is not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("Output is missing required field '{field}'")]
    MissingField { field: String },

    #[error("Output field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Output is empty")]
    Empty,
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required capability: {capability}")]
    MissingCapability { capability: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl From<Box<figment::Error>> for ConfigError {
    fn from(err: Box<figment::Error>) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

/// Errors that a retry policy knows how to classify.
pub trait Retryable {
    /// Whether the failure is transient and worth another attempt.
    fn is_retryable(&self) -> bool;

    /// Server-requested minimum wait before the next attempt, in milliseconds.
    fn retry_after_ms(&self) -> Option<u64> {
        None
    }
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Connection { .. }
                | LlmError::Timeout { .. }
                | LlmError::Server { .. }
        )
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LlmError::RateLimited { retry_after_secs } => {
                Some(retry_after_secs.saturating_mul(1000))
            }
            _ => None,
        }
    }
}

impl Retryable for SearchError {
    fn is_retryable(&self) -> bool {
        match self {
            SearchError::Backend { .. }
            | SearchError::Unavailable { .. }
            | SearchError::Timeout { .. } => true,
            SearchError::DimensionMismatch { .. } => false,
            SearchError::Embedding(inner) => inner.is_retryable(),
        }
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            SearchError::Embedding(inner) => inner.retry_after_ms(),
            _ => None,
        }
    }
}

impl Retryable for RetrievalError {
    fn is_retryable(&self) -> bool {
        match self {
            RetrievalError::Llm(e) => e.is_retryable(),
            RetrievalError::Search(e) => e.is_retryable(),
            RetrievalError::PartialRetrieval { .. } => true,
            _ => false,
        }
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            RetrievalError::Llm(e) => e.retry_after_ms(),
            RetrievalError::Search(e) => e.retry_after_ms(),
            _ => None,
        }
    }
}

/// A type alias for results using the top-level `RetrievalError`.
pub type Result<T> = std::result::Result<T, RetrievalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_partial() {
        let err = RetrievalError::PartialRetrieval {
            found: 1,
            expected: 3,
        };
        assert_eq!(
            err.to_string(),
            "Partial retrieval: requested 3 identifiers, found 1"
        );
    }

    #[test]
    fn test_error_display_no_relevant_documents() {
        let err = RetrievalError::NoRelevantDocuments {
            failed_searches: 4,
            attempted_searches: 4,
        };
        assert_eq!(
            err.to_string(),
            "No relevant documents found (4 of 4 searches failed)"
        );
    }

    #[test]
    fn test_error_from_llm() {
        let err: RetrievalError = LlmError::AuthFailed {
            provider: "openai".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "LLM error: Authentication failed for provider openai"
        );
    }

    #[test]
    fn test_llm_error_retryable_classification() {
        assert!(LlmError::RateLimited { retry_after_secs: 2 }.is_retryable());
        assert!(LlmError::Timeout { timeout_secs: 30 }.is_retryable());
        assert!(
            LlmError::Server {
                status: 503,
                message: "busy".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::AuthFailed {
                provider: "x".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::ResponseParse {
                message: "bad".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_rate_limit_retry_after() {
        let err = LlmError::RateLimited { retry_after_secs: 3 };
        assert_eq!(err.retry_after_ms(), Some(3000));
        let wrapped = RetrievalError::Llm(err);
        assert_eq!(wrapped.retry_after_ms(), Some(3000));

        let huge = LlmError::RateLimited {
            retry_after_secs: u64::MAX / 10,
        };
        assert_eq!(huge.retry_after_ms(), Some(u64::MAX));
    }

    #[test]
    fn test_search_error_retryable_classification() {
        assert!(
            SearchError::Unavailable {
                message: "503".into()
            }
            .is_retryable()
        );
        assert!(
            !SearchError::DimensionMismatch {
                expected: 3,
                actual: 4
            }
            .is_retryable()
        );
        assert!(
            !SearchError::Embedding(LlmError::AuthFailed {
                provider: "x".into()
            })
            .is_retryable()
        );
    }

    #[test]
    fn test_partial_retrieval_is_retryable() {
        let err = RetrievalError::PartialRetrieval {
            found: 0,
            expected: 1,
        };
        assert!(err.is_retryable());
        assert!(!RetrievalError::Cancelled.is_retryable());
        assert!(
            !RetrievalError::InvalidInput {
                reason: "empty".into()
            }
            .is_retryable()
        );
    }
}
