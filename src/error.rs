//! Error types for the reconciliation engine.
//!
//! Per-invocation failures (missing credential, unauthorized caller) surface
//! as values of [`EngineError`]; per-record failures inside a batch run are
//! caught by the driver and bucketed instead of propagating.

/// The main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No caller identity was supplied.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The caller lacks rights for the target account.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The target user or subscription does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A billing provider call failed after retries.
    ///
    /// The message carries operation context only, never the raw provider
    /// error body.
    #[error("Billing provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Missing or invalid credential/configuration. Fatal for the whole
    /// invocation. Messages carry the masked credential form at most.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The entity store reported a failure.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn provider_unavailable(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Stable error code for operator tooling.
    ///
    /// Dry-run and apply failures share these codes so callers can handle
    /// both uniformly.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Configuration(_) => "configuration_error",
            Self::Storage(_) => "storage_error",
            Self::Anyhow(_) => "internal",
        }
    }

    /// A message safe to surface to callers.
    ///
    /// Provider and internal errors are reduced to generic text so raw
    /// upstream error bodies (which may quote request parameters) never
    /// leak past the engine boundary.
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            Self::ProviderUnavailable(_) => "billing provider is unavailable".to_string(),
            Self::Storage(_) => "storage operation failed".to_string(),
            Self::Anyhow(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the error is transient and the operation may be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::unauthorized("x").code(), "unauthorized");
        assert_eq!(EngineError::forbidden("x").code(), "forbidden");
        assert_eq!(EngineError::not_found("x").code(), "not_found");
        assert_eq!(
            EngineError::provider_unavailable("x").code(),
            "provider_unavailable"
        );
        assert_eq!(EngineError::configuration("x").code(), "configuration_error");
    }

    #[test]
    fn safe_message_hides_provider_detail() {
        let err = EngineError::provider_unavailable(
            "subscriptions.list failed with status 500",
        );
        assert!(!err.safe_message().contains("500"));
        assert_eq!(err.safe_message(), "billing provider is unavailable");
    }

    #[test]
    fn safe_message_keeps_caller_facing_detail() {
        let err = EngineError::forbidden("caller may only reconcile their own account");
        assert!(err.safe_message().contains("own account"));
    }
}
