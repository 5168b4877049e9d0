//! Error types for the Chatline domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context (cache, queue, durable store, model) has its own
//! error enum; the top-level [`Error`] wraps them all.

use thiserror::Error;

/// The top-level error type for all Chatline operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Cache errors ---
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    // --- Queue errors ---
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    // --- Durable store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Generative model errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Handler errors ---
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Cached value could not be decoded: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Publish timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Malformed envelope: {0}")]
    Parse(String),

    #[error("Queue closed: {0}")]
    Closed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Offset commit failed: {0}")]
    Commit(String),
}

impl QueueError {
    /// Whether retrying the same publish could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Duplicate key: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

impl StoreError {
    /// A primary-key or natural-key collision. Replays of an already
    /// persisted message surface as this.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by model endpoint, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Model not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("Generation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("store rejected write: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_displays_correctly() {
        let err = Error::Model(ModelError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn conflict_is_classified() {
        assert!(StoreError::Conflict("messages.id=7".into()).is_conflict());
        assert!(!StoreError::Storage("disk full".into()).is_conflict());
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(QueueError::Transport("broker down".into()).is_retryable());
        assert!(QueueError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!QueueError::Parse("bad json".into()).is_retryable());
        assert!(!QueueError::Cancelled.is_retryable());
    }

    #[test]
    fn handler_error_wraps_store_error() {
        let err: HandlerError = StoreError::Storage("locked".into()).into();
        assert!(err.to_string().contains("locked"));
    }
}
