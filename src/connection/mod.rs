//! Database connection collaborators
//!
//! The coordinator reaches the database only through these traits:
//! - `Connection`: one handle to one node
//! - `ConnectionProvider`: resolves a domain to primary and replica handles
//!
//! Handles are shared (`Arc<Mutex<..>>`) because a scoped lock must be able to
//! release through the same session that acquired it while the load balancer
//! keeps using that session for queries.
//!
//! The coordinator never parses SQL. Statements are opaque strings.

mod errors;
pub mod memory;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::domain::DomainId;

pub use errors::{ConnectionError, ConnectionResult};

/// Opaque, monotonically comparable marker of applied data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationPosition(u64);

impl ReplicationPosition {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// True when a node at `self` has applied everything up to `target`.
    pub fn has_reached(&self, target: ReplicationPosition) -> bool {
        self.0 >= target.0
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of executing one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    /// Rows changed by a write
    pub affected_rows: u64,
    /// Rows returned by a read
    pub rows: Vec<serde_json::Value>,
}

/// One handle to one database node.
pub trait Connection: Send {
    /// Server name, used as the writer identifier and in log lines
    fn server_name(&self) -> &str;

    /// Open a transaction, tagged with the caller name
    fn begin(&mut self, caller: &str) -> ConnectionResult<()>;

    /// Commit the open transaction
    fn commit(&mut self, caller: &str) -> ConnectionResult<()>;

    /// Roll back the open transaction
    fn rollback(&mut self, caller: &str) -> ConnectionResult<()>;

    /// Execute one statement
    fn execute(&mut self, statement: &str) -> ConnectionResult<QueryOutcome>;

    /// Position written (primary) or applied (replica) by this node
    fn replication_position(&mut self) -> ConnectionResult<ReplicationPosition>;

    /// Try to take an advisory lock, waiting at most `timeout`.
    /// Acquisitions by the same session nest; each needs its own `unlock`.
    fn try_lock(&mut self, name: &str, timeout: Duration) -> ConnectionResult<bool>;

    /// Release an advisory lock held by this session
    fn unlock(&mut self, name: &str) -> ConnectionResult<bool>;
}

/// Shared handle to a connection
pub type SharedConnection = Arc<Mutex<dyn Connection>>;

/// Wrap a connection into a shared handle.
pub fn share<C: Connection + 'static>(connection: C) -> SharedConnection {
    Arc::new(Mutex::new(connection))
}

/// Lock a shared connection.
///
/// A panic while a connection was locked leaves the session itself intact,
/// so poisoning is ignored.
pub fn lock_connection(connection: &SharedConnection) -> MutexGuard<'_, dyn Connection + 'static> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Longest wait a deadline is clamped to
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 3600);

/// Deadline `timeout` from now. Timeouts too large for the clock are
/// clamped instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(MAX_WAIT))
        .unwrap_or(now)
}

/// Resolves domains to node handles.
pub trait ConnectionProvider: Send + Sync {
    /// Handle to the domain's primary
    fn primary(&self, domain: &DomainId) -> ConnectionResult<SharedConnection>;

    /// Handles to the domain's replicas (possibly none)
    fn replicas(&self, domain: &DomainId) -> ConnectionResult<Vec<SharedConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        let low = ReplicationPosition::new(41);
        let high = ReplicationPosition::new(42);
        assert!(high.has_reached(low));
        assert!(high.has_reached(high));
        assert!(!low.has_reached(high));
    }

    #[test]
    fn test_position_serializes_as_number() {
        let json = serde_json::to_string(&ReplicationPosition::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
