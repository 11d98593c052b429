//! Error types for the flotilla operator

use std::time::Duration;

use thiserror::Error;

/// Main error type for flotilla operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for ManagedCluster specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Managed-Kubernetes provider error
    #[error("provider error: {0}")]
    Provider(String),

    /// A status write raced with another writer and was rejected
    #[error("conflict error: {0}")]
    Conflict(String),

    /// Provisioning did not reach the running state within the poll budget
    #[error("poll timed out after {elapsed:?} (budget {budget:?})")]
    PollTimeout {
        /// Wall-clock time spent polling before giving up
        elapsed: Duration,
        /// The configured poll budget
        budget: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Reconciliation was interrupted by controller shutdown
    #[error("interrupted by shutdown")]
    Interrupted,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether the worker loop should re-queue the key with backoff.
    ///
    /// Provider and Kubernetes API failures may recover on their own, so the
    /// key is retried. Validation failures and exhausted poll budgets are
    /// terminal: the resource stays `Failed` until a new notification (e.g.
    /// a spec edit) re-triggers reconciliation. A conflict that survives the
    /// in-pass re-read retries is treated like a transient API failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) | Self::Provider(_) | Self::Conflict(_) => true,
            Self::Validation(_)
            | Self::PollTimeout { .. }
            | Self::Serialization(_)
            | Self::Interrupted => false,
        }
    }

    /// True if this is a raced-write conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: spec validation catches misconfigurations before provisioning
    ///
    /// When a user creates a ManagedCluster with an invalid spec, the
    /// validation layer rejects it with a clear message and the provider is
    /// never called.
    #[test]
    fn story_validation_prevents_invalid_cluster_creation() {
        let err = Error::validation("spec.nodePools must contain at least one pool");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("at least one pool"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: provider errors surface remote failures with their cause
    #[test]
    fn story_provider_errors_during_cluster_provisioning() {
        let err = Error::provider("DOKS create request failed: 401 Unauthorized");
        assert!(err.to_string().contains("provider error"));
        assert!(err.to_string().contains("401"));

        match Error::provider("any provider issue") {
            Error::Provider(msg) => assert_eq!(msg, "any provider issue"),
            _ => panic!("Expected Provider variant"),
        }
    }

    /// Story: errors are categorized for worker-loop handling
    ///
    /// Retryable errors are re-queued with backoff; terminal errors leave
    /// the resource Failed until the next notification arrives.
    #[test]
    fn story_error_categorization_for_worker_handling() {
        assert!(Error::provider("timeout").is_retryable());
        assert!(Error::conflict("resourceVersion mismatch").is_retryable());

        assert!(!Error::validation("bad spec").is_retryable());
        assert!(!Error::PollTimeout {
            elapsed: Duration::from_secs(600),
            budget: Duration::from_secs(600),
        }
        .is_retryable());
        assert!(!Error::Interrupted.is_retryable());
    }

    #[test]
    fn conflict_predicate_matches_only_conflicts() {
        assert!(Error::conflict("raced").is_conflict());
        assert!(!Error::provider("raced").is_conflict());
    }

    #[test]
    fn poll_timeout_reports_budget() {
        let err = Error::PollTimeout {
            elapsed: Duration::from_secs(601),
            budget: Duration::from_secs(600),
        };
        assert!(err.to_string().contains("600"));
    }
}
