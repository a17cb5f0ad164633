//! Error types for the ingestion pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
///
/// Every stage failure maps to exactly one variant; the coordinator decides
/// the terminal ingestion status from the variant, so retryability and
/// rejection semantics live here rather than at the call sites.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Format detector returned Unknown; the ingestion is rejected, not retried
    #[error("Unsupported format{}", .hint.as_ref().map(|h| format!(" ({})", h)).unwrap_or_default())]
    UnsupportedFormat { hint: Option<String> },

    /// Extraction failed with nothing recoverable; rejected, not retried
    #[error("Corrupt {format} payload: {message}")]
    Corrupt { format: String, message: String },

    /// Payload exceeds the configured size cap; rejected before any decoding
    #[error("Input of {bytes} bytes exceeds the {limit}-byte cap")]
    InputTooLarge { bytes: u64, limit: u64 },

    /// Transient storage backend failure; retried with backoff
    #[error("Transient storage failure: {0}")]
    TransientStorage(String),

    /// Retry budget exhausted or backend out of space; terminal failure
    #[error("Storage exhausted after {attempts} attempt(s): {message}")]
    StorageExhausted { attempts: u32, message: String },

    /// A pipeline stage exceeded its time budget
    #[error("Stage '{stage}' timed out after {secs}s")]
    StageTimeout { stage: &'static str, secs: u64 },

    /// Ingestion cancelled by the caller between stages
    #[error("Ingestion cancelled")]
    Cancelled,

    /// Internal invariant broken; never retried, never swallowed
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Object not found in the catalog or blob store
    #[error("Object not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catalog database error
    #[error("Catalog error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a corrupt-payload error
    pub fn corrupt(format: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Create a transient storage error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStorage(message.into())
    }

    /// Create an invariant violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the storage orchestrator may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientStorage(_))
    }

    /// Whether the attempt ends as rejected (bad input) rather than failed
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat { .. } | Error::Corrupt { .. } | Error::InputTooLarge { .. }
        )
    }
}
