//! Coordination counters
//!
//! - Counters only, monotonic
//! - Reset only when the registry is recreated
//! - Thread-safe, Relaxed ordering

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by the coordinator, its load balancers, the chronology
/// tracker and the lock primitive.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    rounds_begun: AtomicU64,
    rounds_committed: AtomicU64,
    rounds_rolled_back: AtomicU64,
    approval_failures: AtomicU64,
    commit_failures: AtomicU64,
    callback_failures: AtomicU64,
    delegated_commits: AtomicU64,
    tickets_rejected: AtomicU64,
    replica_waits: AtomicU64,
    replica_wait_timeouts: AtomicU64,
    chronology_persisted: AtomicU64,
    chronology_persist_failures: AtomicU64,
    chronology_waits: AtomicU64,
    chronology_pins: AtomicU64,
    chronology_tokens_discarded: AtomicU64,
    locks_acquired: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // Rounds

    pub fn increment_rounds_begun(&self) {
        Self::bump(&self.rounds_begun);
    }

    pub fn increment_rounds_committed(&self) {
        Self::bump(&self.rounds_committed);
    }

    pub fn increment_rounds_rolled_back(&self) {
        Self::bump(&self.rounds_rolled_back);
    }

    pub fn increment_approval_failures(&self) {
        Self::bump(&self.approval_failures);
    }

    pub fn increment_commit_failures(&self) {
        Self::bump(&self.commit_failures);
    }

    pub fn increment_callback_failures(&self) {
        Self::bump(&self.callback_failures);
    }

    pub fn increment_delegated_commits(&self) {
        Self::bump(&self.delegated_commits);
    }

    pub fn increment_tickets_rejected(&self) {
        Self::bump(&self.tickets_rejected);
    }

    // Replication

    pub fn increment_replica_waits(&self) {
        Self::bump(&self.replica_waits);
    }

    pub fn increment_replica_wait_timeouts(&self) {
        Self::bump(&self.replica_wait_timeouts);
    }

    // Chronology

    pub fn increment_chronology_persisted(&self) {
        Self::bump(&self.chronology_persisted);
    }

    pub fn increment_chronology_persist_failures(&self) {
        Self::bump(&self.chronology_persist_failures);
    }

    pub fn increment_chronology_waits(&self) {
        Self::bump(&self.chronology_waits);
    }

    pub fn increment_chronology_pins(&self) {
        Self::bump(&self.chronology_pins);
    }

    pub fn increment_chronology_tokens_discarded(&self) {
        Self::bump(&self.chronology_tokens_discarded);
    }

    // Locks

    pub fn increment_locks_acquired(&self) {
        Self::bump(&self.locks_acquired);
    }

    pub fn increment_lock_timeouts(&self) {
        Self::bump(&self.lock_timeouts);
    }

    /// Get all counters as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            rounds_begun: load(&self.rounds_begun),
            rounds_committed: load(&self.rounds_committed),
            rounds_rolled_back: load(&self.rounds_rolled_back),
            approval_failures: load(&self.approval_failures),
            commit_failures: load(&self.commit_failures),
            callback_failures: load(&self.callback_failures),
            delegated_commits: load(&self.delegated_commits),
            tickets_rejected: load(&self.tickets_rejected),
            replica_waits: load(&self.replica_waits),
            replica_wait_timeouts: load(&self.replica_wait_timeouts),
            chronology_persisted: load(&self.chronology_persisted),
            chronology_persist_failures: load(&self.chronology_persist_failures),
            chronology_waits: load(&self.chronology_waits),
            chronology_pins: load(&self.chronology_pins),
            chronology_tokens_discarded: load(&self.chronology_tokens_discarded),
            locks_acquired: load(&self.locks_acquired),
            lock_timeouts: load(&self.lock_timeouts),
        }
    }
}

/// A point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub rounds_begun: u64,
    pub rounds_committed: u64,
    pub rounds_rolled_back: u64,
    pub approval_failures: u64,
    pub commit_failures: u64,
    pub callback_failures: u64,
    pub delegated_commits: u64,
    pub tickets_rejected: u64,
    pub replica_waits: u64,
    pub replica_wait_timeouts: u64,
    pub chronology_persisted: u64,
    pub chronology_persist_failures: u64,
    pub chronology_waits: u64,
    pub chronology_pins: u64,
    pub chronology_tokens_discarded: u64,
    pub locks_acquired: u64,
    pub lock_timeouts: u64,
}
