//! Error taxonomy shared across the engine
//!
//! Failures surface as values: step handlers return structured
//! [`RunError`]s inside `StepResult::Fail`, and the public operation
//! surface maps every [`CoreError`] variant onto a stable error code.

use serde::{Deserialize, Serialize};

/// Category attached to a handler failure.
///
/// Categories drive retry decisions: `NonRetryable`, `Validation` and
/// `Cancelled` failures are never retried, everything else follows the
/// run's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network or upstream-service failure
    Network,

    /// A quality gate recorded FAIL results
    QualityGate,

    /// Wait or executor bound exceeded
    Timeout,

    /// Run was cancelled
    Cancelled,

    /// Input failed handler preconditions
    Validation,

    /// Resource exhaustion (memory, disk, quota)
    Resource,

    /// Explicitly marked non-retryable by the handler
    NonRetryable,

    /// Unclassified
    Unknown,
}

impl ErrorCategory {
    /// Whether failures in this category are eligible for retry at all.
    pub fn retry_eligible(&self) -> bool {
        !matches!(
            self,
            Self::NonRetryable | Self::Validation | Self::Cancelled
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::QualityGate => "quality_gate",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::NonRetryable => "non_retryable",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Structured failure attached to a run or step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    /// Human-readable message
    pub message: String,

    /// Failure category
    pub category: ErrorCategory,

    /// Whether a retry may succeed
    pub retryable: bool,
}

impl RunError {
    /// Create a retryable error with an unclassified category.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Unknown,
            retryable: true,
        }
    }

    /// Create an error with an explicit category; retryability follows
    /// the category.
    pub fn categorized(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            retryable: category.retry_eligible(),
            category,
        }
    }

    /// Create a non-retryable error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::NonRetryable,
            retryable: false,
        }
    }

    /// Cancellation as an error value.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Cancelled,
            retryable: false,
        }
    }

    /// Override the retryable flag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.category)
    }
}

impl std::error::Error for RunError {}

/// Errors raised by core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Request doesn't meet preconditions
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Referenced entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Idempotency violation or state conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Concurrency guard refused the lease
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// A configured bound was exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Explicit cancellation
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A step handler failed
    #[error("handler error: {0}")]
    Handler(RunError),

    /// Backing store failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted data doesn't match the expected shape
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Executor cannot accept work
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

impl CoreError {
    /// Stable machine-readable code for the operations envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed(_) => "validation_failed",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::LockUnavailable(_) => "lock_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Handler(_) => "handler_error",
            Self::Storage(_) => "storage_error",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
        }
    }

    /// Shorthand for a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_retry_eligibility() {
        assert!(ErrorCategory::Network.retry_eligible());
        assert!(ErrorCategory::Timeout.retry_eligible());
        assert!(!ErrorCategory::NonRetryable.retry_eligible());
        assert!(!ErrorCategory::Validation.retry_eligible());
        assert!(!ErrorCategory::Cancelled.retry_eligible());
    }

    #[test]
    fn test_categorized_follows_category() {
        let err = RunError::categorized("connection reset", ErrorCategory::Network);
        assert!(err.retryable);

        let err = RunError::categorized("bad input", ErrorCategory::Validation);
        assert!(!err.retryable);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            CoreError::ValidationFailed("x".into()).code(),
            "validation_failed"
        );
        assert_eq!(CoreError::not_found("run", "abc").code(), "not_found");
        assert_eq!(
            CoreError::Handler(RunError::new("boom")).code(),
            "handler_error"
        );
    }

    #[test]
    fn test_run_error_serialization() {
        let err = RunError::categorized("gate failed", ErrorCategory::QualityGate);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"category\":\"quality_gate\""));

        let parsed: RunError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, parsed);
    }
}
