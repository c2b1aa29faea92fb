//! Error types for pullci.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Checkout or launch failure. Never recorded as a build result.
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("coordination store error: {0}")]
    Store(String),

    #[error("work queue error: {0}")]
    Queue(String),

    /// The commit was marked pending but its event never reached the queue.
    #[error("orphaned pending state for {repo}@{sha}: {reason}")]
    OrphanedPending {
        repo: String,
        sha: String,
        reason: String,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether redelivering the same message could succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Setup(_) | Error::Store(_) | Error::Queue(_) | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_and_infra_errors_are_retryable() {
        assert!(Error::Setup("clone".into()).is_retryable());
        assert!(Error::Store("down".into()).is_retryable());
        assert!(Error::Queue("closed".into()).is_retryable());
    }

    #[test]
    fn test_bad_payload_is_not_retryable() {
        assert!(!Error::InvalidInput("not json".into()).is_retryable());
        assert!(!Error::NotFound("payload".into()).is_retryable());
    }

    #[test]
    fn test_orphaned_message_names_commit() {
        let err = Error::OrphanedPending {
            repo: "moby/moby".into(),
            sha: "abc123".into(),
            reason: "publish timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "orphaned pending state for moby/moby@abc123: publish timed out"
        );
    }
}
