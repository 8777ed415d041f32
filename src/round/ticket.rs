//! Ownership tickets and delegated commit types

use std::time::Duration;

use uuid::Uuid;

use crate::domain::DomainId;

/// Capability proving the holder may finish a write-free round owned by
/// someone else.
///
/// Only `RoundCoordinator::issue_empty_ticket` creates one, and only when no
/// load balancer holds pending writes. It is consumed by the delegated
/// commit it authorizes.
#[derive(Debug, PartialEq, Eq)]
pub struct OwnershipTicket {
    owner: Uuid,
}

impl OwnershipTicket {
    pub(crate) fn new(owner: Uuid) -> Self {
        Self { owner }
    }

    /// Coordinator instance that issued this ticket
    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

/// Result of `commit_and_wait_for_replication`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketedCommit {
    /// The ticket was issued by another coordinator; nothing happened
    Rejected,

    /// The round was committed
    Committed {
        /// Every replica reached the primary's position in time
        replicas_caught_up: bool,
        /// The commit ran on behalf of another round owner, whose round was
        /// reopened afterwards
        delegated: bool,
    },
}

impl TicketedCommit {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Options for waiting on replicas after writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationWaitOptions {
    /// Only wait on this domain
    pub domain: Option<DomainId>,
    /// Override the configured replication wait timeout
    pub timeout: Option<Duration>,
}

impl ReplicationWaitOptions {
    pub fn for_domain(domain: impl Into<DomainId>) -> Self {
        Self {
            domain: Some(domain.into()),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
