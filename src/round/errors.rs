//! Round Error Types
//!
//! - Integrity-threatening errors abort the round and propagate
//! - Post-commit callback errors surface only after every callback ran
//! - Replication timeouts and lock timeouts are not errors at all

use std::fmt;

use crate::balancer::CallbackError;
use crate::connection::ConnectionError;

/// Round error type
#[derive(Debug, Clone)]
pub struct RoundError {
    /// Error kind
    pub kind: RoundErrorKind,
    /// Error message
    pub message: String,
}

/// Round error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundErrorKind {
    /// A round began while another round was open, or a load balancer is
    /// already bound to a different round
    RoundConflict,

    /// A caller tried to finish a round it does not own, or a phase was
    /// entered from the wrong stage
    RoundMismatch,

    /// A load balancer refused the pre-commit check; nothing was committed
    ApprovalFailure,

    /// Pre-commit work failed or never settled; nothing was committed
    PreCommitFailure,

    /// A primary failed to commit after the durable point
    CommitFailure,

    /// A post-commit or post-rollback callback failed; writes are untouched
    PostCommitCallback,

    /// A connection could not be established or used
    Connection,
}

impl RoundError {
    /// Create a new round error.
    pub fn new(kind: RoundErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn round_conflict(message: impl Into<String>) -> Self {
        Self::new(RoundErrorKind::RoundConflict, message)
    }

    pub fn round_mismatch(message: impl Into<String>) -> Self {
        Self::new(RoundErrorKind::RoundMismatch, message)
    }

    pub fn approval_failure(message: impl Into<String>) -> Self {
        Self::new(RoundErrorKind::ApprovalFailure, message)
    }

    pub fn pre_commit_failure(message: impl Into<String>) -> Self {
        Self::new(RoundErrorKind::PreCommitFailure, message)
    }

    pub fn commit_failure(message: impl Into<String>) -> Self {
        Self::new(RoundErrorKind::CommitFailure, message)
    }

    pub fn post_commit_callback(error: &CallbackError) -> Self {
        Self::new(RoundErrorKind::PostCommitCallback, error.to_string())
    }

    /// Create a forbidden stage transition error.
    pub fn forbidden_transition(from: &str, to: &str) -> Self {
        Self::round_mismatch(format!("forbidden stage transition: {} → {}", from, to))
    }

    /// Errors that abort a round and must fail the request.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self.kind,
            RoundErrorKind::RoundConflict
                | RoundErrorKind::ApprovalFailure
                | RoundErrorKind::PreCommitFailure
                | RoundErrorKind::CommitFailure
        )
    }

    /// True if writes may have become durable before this error was raised.
    pub fn after_durable_point(&self) -> bool {
        matches!(
            self.kind,
            RoundErrorKind::CommitFailure | RoundErrorKind::PostCommitCallback
        )
    }
}

impl fmt::Display for RoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoundError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for RoundError {}

impl From<ConnectionError> for RoundError {
    fn from(err: ConnectionError) -> Self {
        Self::new(RoundErrorKind::Connection, err.to_string())
    }
}

/// Result type for round operations
pub type RoundResult<T> = Result<T, RoundError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainId;

    #[test]
    fn test_integrity_failures() {
        assert!(RoundError::round_conflict("x").is_integrity_failure());
        assert!(RoundError::approval_failure("x").is_integrity_failure());
        assert!(RoundError::pre_commit_failure("x").is_integrity_failure());
    }

    #[test]
    fn test_bookkeeping_failures_are_not_integrity_failures() {
        let callback = CallbackError::new("purge-cache", "timeout");
        assert!(!RoundError::post_commit_callback(&callback).is_integrity_failure());
        assert!(!RoundError::round_mismatch("x").is_integrity_failure());
    }

    #[test]
    fn test_durable_point() {
        assert!(RoundError::commit_failure("x").after_durable_point());
        assert!(!RoundError::approval_failure("x").after_durable_point());
    }

    #[test]
    fn test_connection_error_conversion() {
        let err: RoundError = ConnectionError::UnknownDomain(DomainId::new("main")).into();
        assert_eq!(err.kind, RoundErrorKind::Connection);
        assert!(err.message.contains("main"));
    }

    #[test]
    fn test_forbidden_transition_message() {
        let err = RoundError::forbidden_transition("Committing", "Beginning");
        assert_eq!(err.kind, RoundErrorKind::RoundMismatch);
        assert!(err.message.contains("Committing"));
    }
}
