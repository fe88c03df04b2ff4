//! Error types for the `ragkit` crate.

use thiserror::Error;

/// Errors that can occur in retrieval operations.
///
/// Every variant maps to a stable machine-readable category via
/// [`RetrievalError::code`]. Raw provider/store error text is carried in
/// the `message` fields for logging; boundary layers are expected to map
/// these into sanitized responses rather than displaying them verbatim.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Malformed input rejected before any I/O: bad UUIDs, wrong embedding
    /// dimensionality, non-finite vector values, out-of-bounds text length,
    /// or a heterogeneous-tenant batch. Never retried.
    #[error("Validation error: {message}")]
    Validation {
        /// A description of what failed validation.
        message: String,
    },

    /// The organization has exhausted its daily embedding quota.
    /// Surfaced immediately, never retried.
    #[error("Quota exceeded for organization {organization_id}: {used}/{limit} embeddings today")]
    QuotaExceeded {
        /// The organization that hit the limit.
        organization_id: String,
        /// The configured daily limit.
        limit: i64,
        /// Usage observed when the request was rejected.
        used: i64,
    },

    /// An error from the embedding provider. Retried internally with
    /// credential rotation and backoff; this surfaces once retries are
    /// exhausted, carrying the last underlying cause.
    #[error("Embedding provider error ({provider}): {message}")]
    Provider {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure (last cause when retries ran out).
        message: String,
    },

    /// An error from the persistent vector store. Surfaced immediately;
    /// idempotent callers may retry at a higher layer.
    #[error("Vector store error ({backend}): {message}")]
    Store {
        /// The store backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// An error from the cache/quota key-value backend.
    #[error("Cache error ({backend}): {message}")]
    Cache {
        /// The cache backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An error in pipeline orchestration.
    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl RetrievalError {
    /// Stable machine-readable category for this error.
    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::Validation { .. } => "validation",
            RetrievalError::QuotaExceeded { .. } => "quota_exceeded",
            RetrievalError::Provider { .. } => "provider",
            RetrievalError::Store { .. } => "store",
            RetrievalError::Cache { .. } => "cache",
            RetrievalError::Config(_) => "config",
            RetrievalError::Pipeline(_) => "pipeline",
        }
    }

    /// Shorthand for a [`RetrievalError::Validation`] with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        RetrievalError::Validation { message: message.into() }
    }
}

/// A convenience result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;
