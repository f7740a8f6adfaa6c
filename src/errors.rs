//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the core returns [`RelayError`]. Retry and
//! circuit-breaker logic classify errors by [`RelayErrorKind`] rather than by
//! matching on enum variants directly, so new error variants can be added
//! without touching retry classification call sites.

use thiserror::Error;

/// Errors surfaced by the transcription relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The remote service rejected a payload's shape (schema/envelope mismatch).
    #[error("schema error: {0}")]
    Schema(String),

    /// Connection lost, I/O failure, timeout, or 5xx from a transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote service asked the caller to slow down.
    #[error("rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Credential rejected or missing; terminal for the affected transport.
    #[error("authentication error: {0}")]
    Auth(String),

    /// No transport tier remains available.
    #[error("all transports exhausted")]
    FallbackExhausted,

    /// The operation was cancelled via `destroy()` or an explicit cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid or missing configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Circuit breaker is open for the target service.
    #[error("circuit open for {service}")]
    CircuitOpen { service: String },
}

/// Coarse classification used by [`crate::core::retry::RetryPolicy`] to decide
/// whether an error is worth retrying, independent of its exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayErrorKind {
    Network,
    Timeout,
    TransportClosed,
    RateLimited,
    ServiceUnavailable,
    Schema,
    Auth,
    Cancelled,
    Configuration,
    Other,
}

impl RelayError {
    pub fn kind(&self) -> RelayErrorKind {
        match self {
            RelayError::Schema(_) => RelayErrorKind::Schema,
            RelayError::Transport(msg) => classify_transport_message(msg),
            RelayError::RateLimited { .. } => RelayErrorKind::RateLimited,
            RelayError::Auth(_) => RelayErrorKind::Auth,
            RelayError::FallbackExhausted => RelayErrorKind::Other,
            RelayError::Cancelled => RelayErrorKind::Cancelled,
            RelayError::Configuration(_) => RelayErrorKind::Configuration,
            RelayError::CircuitOpen { .. } => RelayErrorKind::ServiceUnavailable,
        }
    }

    /// Whether [`crate::core::retry::RetryPolicy`] should attempt this error again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            RelayErrorKind::Network
                | RelayErrorKind::Timeout
                | RelayErrorKind::TransportClosed
                | RelayErrorKind::RateLimited
                | RelayErrorKind::ServiceUnavailable
        )
    }
}

fn classify_transport_message(msg: &str) -> RelayErrorKind {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        RelayErrorKind::Timeout
    } else if lower.contains("closed") || lower.contains("disconnected") || lower.contains("reset")
    {
        RelayErrorKind::TransportClosed
    } else if lower.contains("unavailable") || lower.contains("503") {
        RelayErrorKind::ServiceUnavailable
    } else {
        RelayErrorKind::Network
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
