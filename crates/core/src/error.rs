//! Error types for the Turnstile domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! Detection itself never surfaces errors — an analysis failure inside the
//! loop detector degrades to "no loop". The variants here cover the paths
//! that legitimately reject: the model client used by the semantic check and
//! the per-request outcome of the concurrency gate.

use thiserror::Error;

/// The top-level error type for all Turnstile operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model client errors ---
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    // --- Concurrency gate errors ---
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

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

/// Failures from the inference client behind the semantic loop check or a
/// gated request. Transient variants are retryable by the caller; permanent
/// ones are surfaced immediately.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Model is still loading: {0}")]
    ModelLoading(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Backend out of memory: {0}")]
    OutOfMemory(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Terminal outcome for one request submitted to the concurrency gate.
///
/// Each variant affects exactly the request it is returned for — sibling
/// queued or active requests are untouched.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Request timed out after {waited_ms}ms waiting for an execution slot")]
    QueueTimeout { waited_ms: u64 },

    #[error("Request was aborted while queued")]
    Aborted,

    #[error("Queue was cleared while the request was waiting")]
    QueueCleared,

    #[error("Backend request failed: {0}")]
    Backend(#[from] ClientError),

    #[error("Request work panicked: {0}")]
    WorkPanicked(String),
}
