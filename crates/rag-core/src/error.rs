//! Error types for the query pipeline.

use thiserror::Error;

/// Result type alias using RagError.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur in the query pipeline.
///
/// Only configuration problems and failures of the generation call itself
/// are meant to reach the end user. The remaining variants are produced by
/// optional stages and are absorbed by their callers.
#[derive(Error, Debug)]
pub enum RagError {
    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// No API key configured for the requested provider.
    #[error("No credential configured for provider {provider}")]
    MissingCredential { provider: String },

    /// Generation backend answered with a non-2xx status.
    #[error("Upstream error {status}: {body}")]
    Upstream { status: u16, body: String },

    /// A streamed response never produced a decodable frame.
    #[error("Malformed stream: {message}")]
    MalformedStream { message: String },

    /// The per-request deadline was exceeded.
    #[error("Deadline exceeded during {stage} after {elapsed_ms}ms")]
    Timeout { stage: String, elapsed_ms: u64 },

    /// Invalid argument provided.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Document not found.
    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    /// Database error.
    #[error("Database error: {message}")]
    Database { message: String },

    /// Embedding model error.
    #[error("Embedding error: {message}")]
    Embedding { message: String },

    /// Retrieval path error.
    #[error("Retrieval error: {message}")]
    Retrieval { message: String },

    /// Pairwise relevance model error.
    #[error("Rerank error: {message}")]
    Rerank { message: String },

    /// Cache tier error.
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Transport-level HTTP error.
    #[error("HTTP error: {message}")]
    Http { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RagError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
        }
    }

    /// Create a retrieval error.
    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::Retrieval {
            message: message.into(),
        }
    }

    /// Create a rerank error.
    pub fn rerank(message: impl Into<String>) -> Self {
        Self::Rerank {
            message: message.into(),
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create an HTTP transport error.
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    /// Create a malformed stream error.
    pub fn malformed_stream(message: impl Into<String>) -> Self {
        Self::MalformedStream {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the stable error code reported to callers.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG_ERROR",
            Self::MissingCredential { .. } => "MISSING_CREDENTIAL",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::MalformedStream { .. } => "MALFORMED_STREAM",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::DocumentNotFound { .. } => "DOCUMENT_NOT_FOUND",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Embedding { .. } => "EMBEDDING_ERROR",
            Self::Retrieval { .. } => "RETRIEVAL_ERROR",
            Self::Rerank { .. } => "RERANK_ERROR",
            Self::Cache { .. } => "CACHE_ERROR",
            Self::Http { .. } => "HTTP_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Upstream HTTP status, when the error carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RagError::Upstream {
            status: 429,
            body: "rate limited".to_string(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RagError::MissingCredential {
                provider: "groq".to_string()
            }
            .error_code(),
            "MISSING_CREDENTIAL"
        );
        assert_eq!(RagError::config("bad").error_code(), "CONFIG_ERROR");
        assert_eq!(RagError::cache("down").error_code(), "CACHE_ERROR");
    }

    #[test]
    fn test_status_code() {
        let err = RagError::Upstream {
            status: 503,
            body: String::new(),
        };
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(RagError::internal("x").status_code(), None);
    }
}
