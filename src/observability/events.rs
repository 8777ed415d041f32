//! Observable events for round coordination
//!
//! Every log line names one of these events. Call sites never log free-form
//! event strings.

use std::fmt;

use super::logger::Severity;

/// Observable events emitted by the coordinator and its collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Request lifecycle
    /// Request context constructed
    ContextStart,
    /// Request context flushed and torn down
    ContextShutdown,
    /// Shutdown found a round that was never committed
    ContextRoundAbandoned,

    // Load balancers
    /// Load balancer created for a domain
    BalancerOpened,
    /// Primary rollback failed (best effort)
    BalancerRollbackFailed,
    /// A write statement failed inside a round
    BalancerWriteFailed,
    /// Every replica failed a read, primary used instead
    BalancerReadFallback,

    // Rounds
    /// Round opened
    RoundBegin,
    /// Pre-commit hooks failed or never settled
    RoundPreCommitFailed,
    /// A load balancer refused approval
    RoundApprovalFailed,
    /// A primary commit failed after the durable point
    RoundCommitFailed,
    /// A post-commit or post-rollback callback failed
    RoundCallbackFailed,
    /// Rollback requested after writes became durable
    RoundRollbackIgnored,
    /// Round rolled back by a caller other than its owner
    RoundRollbackOnBehalf,
    /// Round committed on behalf of its owner
    RoundDelegatedCommit,
    /// Ownership ticket refused
    RoundTicketRejected,
    /// Ticket requested while writes are pending
    RoundTicketUnavailable,

    // Replication
    /// Replicas reached the requested position
    ReplicaWaitComplete,
    /// Replicas did not reach the requested position in time
    ReplicaWaitTimeout,
    /// A primary could not report its write position
    ReplicaPositionUnavailable,

    // Chronology protection
    /// Client token discarded as malformed or stale
    ChronologyTokenDiscarded,
    /// Stored positions loaded for a client
    ChronologyLoaded,
    /// Stash still behind the client's write index after waiting
    ChronologyStashLagged,
    /// Stash could not be read
    ChronologyLoadFailed,
    /// Reads for a domain pinned to its primary
    ChronologyPinned,
    /// Positions written to the stash
    ChronologyPersisted,
    /// Positions could not be written to the stash
    ChronologyPersistFailed,

    // Named locks
    /// Advisory lock acquired
    LockAcquired,
    /// Advisory lock not acquired in time
    LockTimeout,
    /// Advisory lock released
    LockReleased,
    /// Advisory lock held past its ttl
    LockOverdue,
    /// Advisory lock release failed
    LockReleaseFailed,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ContextStart => "CONTEXT_START",
            Event::ContextShutdown => "CONTEXT_SHUTDOWN",
            Event::ContextRoundAbandoned => "CONTEXT_ROUND_ABANDONED",

            Event::BalancerOpened => "BALANCER_OPENED",
            Event::BalancerRollbackFailed => "BALANCER_ROLLBACK_FAILED",
            Event::BalancerWriteFailed => "BALANCER_WRITE_FAILED",
            Event::BalancerReadFallback => "BALANCER_READ_FALLBACK",

            Event::RoundBegin => "ROUND_BEGIN",
            Event::RoundPreCommitFailed => "ROUND_PRE_COMMIT_FAILED",
            Event::RoundApprovalFailed => "ROUND_APPROVAL_FAILED",
            Event::RoundCommitFailed => "ROUND_COMMIT_FAILED",
            Event::RoundCallbackFailed => "ROUND_CALLBACK_FAILED",
            Event::RoundRollbackIgnored => "ROUND_ROLLBACK_IGNORED",
            Event::RoundRollbackOnBehalf => "ROUND_ROLLBACK_ON_BEHALF",
            Event::RoundDelegatedCommit => "ROUND_DELEGATED_COMMIT",
            Event::RoundTicketRejected => "ROUND_TICKET_REJECTED",
            Event::RoundTicketUnavailable => "ROUND_TICKET_UNAVAILABLE",

            Event::ReplicaWaitComplete => "REPLICA_WAIT_COMPLETE",
            Event::ReplicaWaitTimeout => "REPLICA_WAIT_TIMEOUT",
            Event::ReplicaPositionUnavailable => "REPLICA_POSITION_UNAVAILABLE",

            Event::ChronologyTokenDiscarded => "CHRONOLOGY_TOKEN_DISCARDED",
            Event::ChronologyLoaded => "CHRONOLOGY_LOADED",
            Event::ChronologyStashLagged => "CHRONOLOGY_STASH_LAGGED",
            Event::ChronologyLoadFailed => "CHRONOLOGY_LOAD_FAILED",
            Event::ChronologyPinned => "CHRONOLOGY_PINNED",
            Event::ChronologyPersisted => "CHRONOLOGY_PERSISTED",
            Event::ChronologyPersistFailed => "CHRONOLOGY_PERSIST_FAILED",

            Event::LockAcquired => "LOCK_ACQUIRED",
            Event::LockTimeout => "LOCK_TIMEOUT",
            Event::LockReleased => "LOCK_RELEASED",
            Event::LockOverdue => "LOCK_OVERDUE",
            Event::LockReleaseFailed => "LOCK_RELEASE_FAILED",
        }
    }

    /// Default severity for this event.
    ///
    /// Integrity failures log at ERROR; freshness and bookkeeping
    /// degradations log at WARN.
    pub fn severity(&self) -> Severity {
        match self {
            Event::RoundPreCommitFailed
            | Event::RoundApprovalFailed
            | Event::RoundCommitFailed
            | Event::RoundCallbackFailed
            | Event::RoundTicketRejected
            | Event::ContextRoundAbandoned
            | Event::BalancerRollbackFailed => Severity::Error,

            Event::BalancerWriteFailed
            | Event::BalancerReadFallback
            | Event::RoundRollbackIgnored
            | Event::RoundTicketUnavailable
            | Event::ReplicaWaitTimeout
            | Event::ReplicaPositionUnavailable
            | Event::ChronologyTokenDiscarded
            | Event::ChronologyStashLagged
            | Event::ChronologyLoadFailed
            | Event::ChronologyPersistFailed
            | Event::LockTimeout
            | Event::LockOverdue
            | Event::LockReleaseFailed => Severity::Warn,

            Event::LockAcquired | Event::LockReleased | Event::ReplicaWaitComplete => {
                Severity::Trace
            }

            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
