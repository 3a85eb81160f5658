//! Error-disposition classification for backend failures.
//!
//! Local inference servers report conditions cloud APIs rarely do — a model
//! still loading into VRAM, the process evicted for memory. The caller's
//! retry layer needs to know which failures are worth retrying and which are
//! terminal for the request, regardless of how the error reached us
//! (typed variant or raw message text).

use turnstile_core::ClientError;

/// Whether a backend failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Transient — the caller may retry with backoff.
    Retryable,
    /// Permanent — surface immediately, never retry.
    Permanent,
}

/// Message substrings indicating a permanent condition. Everything else —
/// connection refused, model loading, timeouts, resets — is transient.
const PERMANENT_PATTERNS: &[&str] = &[
    "out of memory",
    "oom",
    "not found",
    "does not exist",
    "context length",
    "maximum context",
    "token limit",
    "unsupported",
    "invalid model",
];

/// Classify a raw backend error message.
///
/// Unrecognized messages are treated as retryable.
pub fn classify_error_message(message: &str) -> ErrorDisposition {
    let lower = message.to_lowercase();
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        ErrorDisposition::Permanent
    } else {
        ErrorDisposition::Retryable
    }
}

/// Classify a typed client error.
pub fn classify_client_error(error: &ClientError) -> ErrorDisposition {
    match error {
        ClientError::ConnectionRefused(_)
        | ClientError::ModelLoading(_)
        | ClientError::Timeout(_)
        | ClientError::Network(_) => ErrorDisposition::Retryable,

        ClientError::ModelNotFound(_)
        | ClientError::OutOfMemory(_)
        | ClientError::ContextLengthExceeded(_)
        | ClientError::MalformedResponse(_)
        | ClientError::Cancelled => ErrorDisposition::Permanent,

        ClientError::ApiError { message, .. } => classify_error_message(message),
    }
}
