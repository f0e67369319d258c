use thiserror::Error;

/// The custom error type for the runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// An error originating from the sqlx library.
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// An error originating from IO operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A validation error (bad input, unsupported file type, missing field).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A not found error (resource does not exist).
    #[error("Not found: {0}")]
    NotFound(String),

    /// An authentication error (invalid credentials or token).
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// An invalid or revoked session token.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// A vector-store operation error.
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// An embedding-provider error.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// An LLM invocation error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// The agent invocation exceeded its deadline.
    #[error("Agent invocation timed out after {0}s")]
    InvokeTimeout(u64),

    /// An outbound channel send failed after retries.
    #[error("Channel send failed: {0}")]
    ChannelSend(String),

    /// A resource-pressure drop (queue full, caps reached).
    #[error("Resource limit reached: {0}")]
    ResourceLimit(String),

    /// A JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// An internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, Error>` to simplify function signatures.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short machine-readable code used in structured logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Sqlx(_) => "DB_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Authentication(_) => "AUTHENTICATION_FAILED",
            Error::InvalidToken(_) => "INVALID_TOKEN",
            Error::VectorStore(_) => "VECTOR_STORE_ERROR",
            Error::Embedding(_) => "EMBEDDING_ERROR",
            Error::Llm(_) => "LLM_ERROR",
            Error::InvokeTimeout(_) => "AI_INVOKE_TIMEOUT",
            Error::ChannelSend(_) => "CHANNEL_SEND_FAILED",
            Error::ResourceLimit(_) => "RESOURCE_LIMIT",
            Error::Json(_) => "JSON_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transient errors are retried with backoff by callers; everything else
    /// surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Embedding(_) | Error::ChannelSend(_) | Error::VectorStore(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::NotFound("x".into()).error_code(), "NOT_FOUND");
        assert_eq!(Error::InvokeTimeout(60).error_code(), "AI_INVOKE_TIMEOUT");
        assert_eq!(
            Error::ResourceLimit("queue full".into()).error_code(),
            "RESOURCE_LIMIT"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Embedding("5xx".into()).is_transient());
        assert!(Error::ChannelSend("hiccup".into()).is_transient());
        assert!(!Error::Validation("bad phone".into()).is_transient());
    }
}
