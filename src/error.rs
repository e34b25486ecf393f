//! Error types for the voice-session core.

/// Top-level error type for the voice-session core (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bearer token missing, malformed, expired, or nonce replayed.
    #[error("auth error: {0}")]
    Auth(String),

    /// Token-bucket rate limit exceeded for a connection.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Inbound frame exceeded the configured size cap.
    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    /// Malformed JSON or a field failed schema validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A backend (provider or local) is down and failover could not recover.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A backend call exceeded its latency budget.
    #[error("backend timeout: {0}")]
    BackendTimeout(String),

    /// Unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Bandit/Deploy/Feedback state could not be persisted.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Both provider and local backends are unavailable; the call cannot continue.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error (a consumer has gone away).
    #[error("channel error: {0}")]
    Channel(String),
}

impl CoreError {
    /// Stable error code used in the `error` transport message (spec §6).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Auth(_) => "auth",
            CoreError::RateLimited(_) => "rate_limited",
            CoreError::FrameTooLarge(_) => "frame_too_large",
            CoreError::Validation(_) => "validation",
            CoreError::BackendUnavailable(_) => "backend_unavailable",
            CoreError::BackendTimeout(_) => "backend_timeout",
            CoreError::Persistence(_) => "persistence",
            CoreError::Terminal(_) => "terminal",
            CoreError::Internal(_) | CoreError::Io(_) | CoreError::Channel(_) => "internal",
        }
    }

    /// Whether a session built on one backend should retry the same request
    /// against the other backend rather than surfacing the error to the caller.
    #[must_use]
    pub fn is_retryable_by_failover(&self) -> bool {
        matches!(
            self,
            CoreError::BackendUnavailable(_) | CoreError::BackendTimeout(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_spec_table() {
        assert_eq!(CoreError::Auth("x".into()).code(), "auth");
        assert_eq!(CoreError::RateLimited("x".into()).code(), "rate_limited");
        assert_eq!(
            CoreError::FrameTooLarge("x".into()).code(),
            "frame_too_large"
        );
        assert_eq!(
            CoreError::BackendUnavailable("x".into()).code(),
            "backend_unavailable"
        );
        assert_eq!(CoreError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn only_backend_errors_trigger_failover_retry() {
        assert!(CoreError::BackendUnavailable("x".into()).is_retryable_by_failover());
        assert!(CoreError::BackendTimeout("x".into()).is_retryable_by_failover());
        assert!(!CoreError::Auth("x".into()).is_retryable_by_failover());
        assert!(!CoreError::Validation("x".into()).is_retryable_by_failover());
    }
}
