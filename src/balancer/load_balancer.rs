//! Per-cluster load balancer
//!
//! Owns the primary and replica handles of one cluster and the pending-write
//! state of the round currently bound to it. The coordinator drives it through
//! the phased sequence:
//!
//! 1. `begin_changes` binds the round
//! 2. `finalize_changes` drains pre-commit work (repeatable)
//! 3. `approve_changes` checks invariants without side effects
//! 4. `commit_changes` / `rollback_changes` resolve the primary transaction
//! 5. `run_idle_callbacks`, `run_listener_callbacks` run post-resolution work
//!
//! Writes inside a round open a primary transaction lazily, at the first
//! write. Writes outside a round autocommit.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;

use super::callbacks::{
    CallbackResult, Hook, HookHandler, HookList, HookPhase, Listener, Resolution,
    TransactionOutcome,
};
use crate::connection::{
    deadline_after, lock_connection, ConnectionProvider, ConnectionResult, QueryOutcome, ReplicationPosition,
    SharedConnection,
};
use crate::domain::DomainId;
use crate::lock::{self, LockRequest, ScopedLock};
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::round::{RoundError, RoundResult};

/// Options checked by `approve_changes`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// Upper bound on time spent executing writes in the round
    pub max_write_duration: Option<Duration>,
}

impl CommitOptions {
    pub fn with_max_write_duration(limit: Duration) -> Self {
        Self {
            max_write_duration: Some(limit),
        }
    }
}

/// Tunables a load balancer is built with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerSettings {
    /// Sleep between replica position polls
    pub replica_poll_interval: Duration,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            replica_poll_interval: Duration::from_millis(10),
        }
    }
}

/// One cluster: a primary, its replicas, and the round bound to them.
pub struct LoadBalancer {
    domain: DomainId,
    writer_id: String,
    primary: SharedConnection,
    replicas: Vec<SharedConnection>,

    round: Option<String>,
    trx_open: bool,
    pending_writes: usize,
    write_time: Duration,
    trx_error: Option<String>,
    committed_writes: bool,
    last_write_at: Option<DateTime<Utc>>,
    last_outcome: Option<TransactionOutcome>,

    hooks: HookList,
    listeners: Vec<Listener>,

    pinned: bool,
    lagged: bool,
    next_replica: usize,
    poll_interval: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl LoadBalancer {
    /// Build a load balancer over explicit handles.
    pub fn new(
        domain: DomainId,
        primary: SharedConnection,
        replicas: Vec<SharedConnection>,
        settings: &BalancerSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let writer_id = lock_connection(&primary).server_name().to_string();
        let next_replica = if replicas.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..replicas.len())
        };

        Self {
            domain,
            writer_id,
            primary,
            replicas,
            round: None,
            trx_open: false,
            pending_writes: 0,
            write_time: Duration::ZERO,
            trx_error: None,
            committed_writes: false,
            last_write_at: None,
            last_outcome: None,
            hooks: HookList::default(),
            listeners: Vec::new(),
            pinned: false,
            lagged: false,
            next_replica,
            poll_interval: settings.replica_poll_interval,
            metrics,
        }
    }

    /// Resolve `domain` through the provider and build its load balancer.
    pub fn connect(
        domain: DomainId,
        provider: &dyn ConnectionProvider,
        settings: &BalancerSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> ConnectionResult<Self> {
        let primary = provider.primary(&domain)?;
        let replicas = provider.replicas(&domain)?;
        let lb = Self::new(domain, primary, replicas, settings, metrics);

        let replica_count = lb.replicas.len().to_string();
        Logger::emit(
            Event::BalancerOpened,
            &[
                ("domain", lb.domain.as_str()),
                ("replicas", &replica_count),
                ("writer", &lb.writer_id),
            ],
        );
        Ok(lb)
    }

    pub fn domain(&self) -> &DomainId {
        &self.domain
    }

    /// Server name of the primary
    pub fn writer_identifier(&self) -> &str {
        &self.writer_id
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Round currently bound to this load balancer
    pub fn round_id(&self) -> Option<&str> {
        self.round.as_deref()
    }

    /// Handle to the primary, for collaborators such as scoped locks
    pub fn primary_connection(&self) -> SharedConnection {
        Arc::clone(&self.primary)
    }

    fn check_round(&self, round: &str) -> RoundResult<()> {
        match &self.round {
            Some(active) if active != round => Err(RoundError::round_mismatch(format!(
                "{}: round '{}' is bound, '{}' may not finish it",
                self.domain, active, round
            ))),
            _ => Ok(()),
        }
    }

    fn reset_transaction(&mut self) {
        self.trx_open = false;
        self.pending_writes = 0;
        self.write_time = Duration::ZERO;
        self.trx_error = None;
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Run a write on the primary.
    pub fn execute_write(&mut self, statement: &str) -> RoundResult<QueryOutcome> {
        let started = Instant::now();
        let result = match self.round.clone() {
            Some(round) => {
                let mut primary = lock_connection(&self.primary);
                if !self.trx_open {
                    primary.begin(&round)?;
                    self.trx_open = true;
                }
                let result = primary.execute(statement);
                result
            }
            None => {
                let result = lock_connection(&self.primary).execute(statement);
                result
            }
        };

        match result {
            Ok(outcome) => {
                if self.trx_open {
                    self.pending_writes += 1;
                    self.write_time += started.elapsed();
                } else {
                    self.committed_writes = true;
                }
                self.last_write_at = Some(Utc::now());
                Ok(outcome)
            }
            Err(err) => {
                if self.trx_open {
                    let message = err.to_string();
                    Logger::emit(
                        Event::BalancerWriteFailed,
                        &[("domain", self.domain.as_str()), ("error", &message)],
                    );
                    self.trx_error = Some(message);
                }
                Err(err.into())
            }
        }
    }

    /// Run a read.
    ///
    /// Goes to the primary when pinned, when this load balancer holds an open
    /// transaction, or when there are no replicas. Otherwise rotates over
    /// replicas and falls back to the primary if every replica fails.
    pub fn execute_read(&mut self, statement: &str) -> RoundResult<QueryOutcome> {
        if self.pinned || self.trx_open || self.replicas.is_empty() {
            let outcome = lock_connection(&self.primary).execute(statement)?;
            return Ok(outcome);
        }

        let count = self.replicas.len();
        let mut last_error = String::new();
        for attempt in 0..count {
            let index = (self.next_replica + attempt) % count;
            let result = lock_connection(&self.replicas[index]).execute(statement);
            match result {
                Ok(outcome) => {
                    self.next_replica = (index + 1) % count;
                    return Ok(outcome);
                }
                Err(err) => last_error = err.to_string(),
            }
        }

        Logger::emit(
            Event::BalancerReadFallback,
            &[("domain", self.domain.as_str()), ("error", &last_error)],
        );
        let outcome = lock_connection(&self.primary).execute(statement)?;
        Ok(outcome)
    }

    // =========================================================================
    // HOOK REGISTRATION
    // =========================================================================

    /// Register pre-commit work.
    ///
    /// Runs immediately when no round is bound; otherwise it is queued and
    /// runs during `finalize_changes`.
    pub fn on_pre_commit<F>(&mut self, caller: &str, handler: F) -> CallbackResult
    where
        F: FnOnce(&mut LoadBalancer) -> CallbackResult + Send + 'static,
    {
        if self.round.is_none() {
            return handler(self);
        }
        self.hooks.push(Hook {
            caller: caller.to_string(),
            handler: HookHandler::PreCommit(Box::new(handler)),
        });
        Ok(())
    }

    /// Register work to run once the bound round is resolved.
    ///
    /// Runs immediately, as committed, when no round is bound.
    pub fn on_idle<F>(&mut self, caller: &str, handler: F) -> CallbackResult
    where
        F: FnOnce(&mut LoadBalancer, TransactionOutcome) -> CallbackResult + Send + 'static,
    {
        if self.round.is_none() {
            return handler(self, TransactionOutcome::Committed);
        }
        self.hooks.push(Hook {
            caller: caller.to_string(),
            handler: HookHandler::PostResolution(Box::new(handler)),
        });
        Ok(())
    }

    /// Install or replace a named listener called after every resolution.
    pub fn set_listener<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&Resolution) -> CallbackResult + Send + 'static,
    {
        let listener = Listener {
            name: name.to_string(),
            handler: Box::new(handler),
        };
        match self.listeners.iter_mut().find(|l| l.name == name) {
            Some(existing) => *existing = listener,
            None => self.listeners.push(listener),
        }
    }

    pub fn clear_listener(&mut self, name: &str) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.name != name);
        self.listeners.len() != before
    }

    /// Hooks of `phase` still waiting to run
    pub fn queued_hooks(&self, phase: HookPhase) -> usize {
        self.hooks.count(phase)
    }

    // =========================================================================
    // ROUND PHASES
    // =========================================================================

    /// Bind `round` to this load balancer.
    pub fn begin_changes(&mut self, round: &str) -> RoundResult<()> {
        if let Some(active) = &self.round {
            if active != round {
                return Err(RoundError::round_conflict(format!(
                    "{}: round '{}' already holds this load balancer, cannot begin '{}'",
                    self.domain, active, round
                )));
            }
        }
        self.round = Some(round.to_string());
        Ok(())
    }

    /// Run the pre-commit work queued so far and return how much ran.
    ///
    /// Work enqueued while this runs is left for the next call.
    pub fn finalize_changes(&mut self, round: &str) -> RoundResult<usize> {
        self.check_round(round)?;

        let mut executed = 0;
        for hook in self.hooks.take(HookPhase::PreCommit) {
            executed += 1;
            if let HookHandler::PreCommit(handler) = hook.handler {
                // Hooks left in this batch are dropped: the round rolls back.
                handler(self).map_err(|err| {
                    RoundError::pre_commit_failure(format!("{}: {}", self.domain, err))
                })?;
            }
        }
        Ok(executed)
    }

    /// Final pre-commit check. Never changes state.
    pub fn approve_changes(&self, options: &CommitOptions, round: &str) -> RoundResult<()> {
        self.check_round(round)?;

        if let Some(error) = &self.trx_error {
            return Err(RoundError::approval_failure(format!(
                "{}: transaction on {} is in error state: {}",
                self.domain, self.writer_id, error
            )));
        }

        let queued = self.hooks.count(HookPhase::PreCommit);
        if queued > 0 {
            return Err(RoundError::approval_failure(format!(
                "{}: {} pre-commit callbacks never ran",
                self.domain, queued
            )));
        }

        if let Some(limit) = options.max_write_duration {
            if self.write_time > limit {
                return Err(RoundError::approval_failure(format!(
                    "{}: round spent {}ms in writes, limit is {}ms",
                    self.domain,
                    self.write_time.as_millis(),
                    limit.as_millis()
                )));
            }
        }

        Ok(())
    }

    /// Commit the primary transaction. No-op when nothing is pending.
    pub fn commit_changes(&mut self, round: &str) -> RoundResult<()> {
        self.check_round(round)?;
        self.round = None;

        if !self.trx_open {
            self.last_outcome = Some(TransactionOutcome::Committed);
            return Ok(());
        }

        let wrote = self.pending_writes > 0;
        let result = lock_connection(&self.primary).commit(round);
        match result {
            Ok(()) => {
                self.committed_writes |= wrote;
                self.reset_transaction();
                self.last_outcome = Some(TransactionOutcome::Committed);
                Ok(())
            }
            Err(err) => {
                let rollback = lock_connection(&self.primary).rollback(round);
                if let Err(rollback_err) = rollback {
                    self.log_rollback_failure(round, &rollback_err.to_string());
                }
                self.reset_transaction();
                self.last_outcome = Some(TransactionOutcome::RolledBack);
                Err(RoundError::commit_failure(format!(
                    "{}: commit on {} failed: {}",
                    self.domain, self.writer_id, err
                )))
            }
        }
    }

    /// Roll back the primary transaction. Never fails; problems are logged.
    pub fn rollback_changes(&mut self, round: &str) {
        self.round = None;
        drop(self.hooks.take(HookPhase::PreCommit));

        if self.trx_open {
            let result = lock_connection(&self.primary).rollback(round);
            if let Err(err) = result {
                self.log_rollback_failure(round, &err.to_string());
            }
        }
        self.reset_transaction();
        self.last_outcome = Some(TransactionOutcome::RolledBack);
    }

    fn log_rollback_failure(&self, round: &str, error: &str) {
        Logger::emit(
            Event::BalancerRollbackFailed,
            &[
                ("domain", self.domain.as_str()),
                ("error", error),
                ("round", round),
                ("writer", &self.writer_id),
            ],
        );
    }

    fn outcome(&self) -> TransactionOutcome {
        self.last_outcome.unwrap_or(TransactionOutcome::Committed)
    }

    fn log_callback_failure(&self, round: &str, error: &str) {
        self.metrics.increment_callback_failures();
        Logger::emit(
            Event::RoundCallbackFailed,
            &[
                ("domain", self.domain.as_str()),
                ("error", error),
                ("round", round),
            ],
        );
    }

    /// Run every post-resolution hook, including ones registered while
    /// running. Returns the first failure.
    pub fn run_idle_callbacks(&mut self, round: &str) -> CallbackResult {
        let outcome = self.outcome();
        let mut first_error = None;

        loop {
            let hooks = self.hooks.take(HookPhase::PostResolution);
            if hooks.is_empty() {
                break;
            }
            for hook in hooks {
                if let HookHandler::PostResolution(handler) = hook.handler {
                    if let Err(err) = handler(self, outcome) {
                        self.log_callback_failure(round, &err.to_string());
                        first_error.get_or_insert(err);
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Invoke every listener. Returns the first failure.
    pub fn run_listener_callbacks(&mut self, round: &str) -> CallbackResult {
        let resolution = Resolution {
            domain: self.domain.clone(),
            round: round.to_string(),
            outcome: self.outcome(),
        };
        let mut first_error = None;

        for listener in &self.listeners {
            if let Err(err) = (listener.handler)(&resolution) {
                self.log_callback_failure(round, &err.to_string());
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // REPLICATION
    // =========================================================================

    pub fn has_pending_writes(&self) -> bool {
        self.pending_writes > 0
    }

    /// Pending writes, or writes already committed by this load balancer
    pub fn has_or_made_recent_writes(&self) -> bool {
        self.has_pending_writes() || self.committed_writes
    }

    pub fn last_write_at(&self) -> Option<DateTime<Utc>> {
        self.last_write_at
    }

    /// Current write position of the primary
    pub fn primary_position(&self) -> ConnectionResult<ReplicationPosition> {
        lock_connection(&self.primary).replication_position()
    }

    /// Wait until every replica has applied `position`.
    ///
    /// Returns false on timeout. The load balancer is then flagged lagged:
    /// reads may be stale, nothing else changes.
    pub fn wait_for_all(&mut self, position: ReplicationPosition, timeout: Duration) -> bool {
        self.metrics.increment_replica_waits();
        let deadline = deadline_after(timeout);

        for replica in &self.replicas {
            loop {
                let reached = lock_connection(replica)
                    .replication_position()
                    .map(|applied| applied.has_reached(position))
                    .unwrap_or(false);
                if reached {
                    break;
                }

                let now = Instant::now();
                if now >= deadline {
                    let server = lock_connection(replica).server_name().to_string();
                    let target = position.to_string();
                    let waited = timeout.as_millis().to_string();
                    Logger::emit(
                        Event::ReplicaWaitTimeout,
                        &[
                            ("domain", self.domain.as_str()),
                            ("position", &target),
                            ("server", &server),
                            ("timeout_ms", &waited),
                        ],
                    );
                    self.metrics.increment_replica_wait_timeouts();
                    self.lagged = true;
                    return false;
                }
                thread::sleep(self.poll_interval.min(deadline - now));
            }
        }

        let target = position.to_string();
        Logger::emit(
            Event::ReplicaWaitComplete,
            &[("domain", self.domain.as_str()), ("position", &target)],
        );
        true
    }

    /// Send every read to the primary for the rest of this request.
    pub fn pin_to_primary(&mut self) {
        self.pinned = true;
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// True once a replica wait timed out
    pub fn is_lagged(&self) -> bool {
        self.lagged
    }

    // =========================================================================
    // LOCKS
    // =========================================================================

    /// Take a named advisory lock on the primary, scoped to this domain.
    pub fn acquire_named_lock(&self, request: &LockRequest) -> Option<ScopedLock> {
        lock::acquire_named_lock(&self.primary, &self.domain, request, &self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::CallbackError;
    use crate::connection::memory::MemoryNode;
    use crate::connection::share;
    use crate::round::RoundErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn balancer(primary: &MemoryNode, replicas: &[&MemoryNode]) -> LoadBalancer {
        let settings = BalancerSettings {
            replica_poll_interval: Duration::from_millis(1),
        };
        LoadBalancer::new(
            DomainId::new("main"),
            share(primary.connect()),
            replicas.iter().map(|r| share(r.connect())).collect(),
            &settings,
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn test_writes_outside_round_autocommit() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);

        lb.execute_write("INSERT INTO t VALUES (1)").unwrap();

        assert_eq!(primary.begins(), 0);
        assert_eq!(primary.position(), 1);
        assert!(!lb.has_pending_writes());
        assert!(lb.has_or_made_recent_writes());
    }

    #[test]
    fn test_round_opens_transaction_at_first_write() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);

        lb.begin_changes("req1").unwrap();
        assert_eq!(primary.begins(), 0);

        lb.execute_write("INSERT INTO t VALUES (1)").unwrap();
        lb.execute_write("INSERT INTO t VALUES (2)").unwrap();
        assert_eq!(primary.begins(), 1);
        assert!(lb.has_pending_writes());

        lb.commit_changes("req1").unwrap();
        assert_eq!(primary.commits(), 1);
        assert_eq!(primary.position(), 2);
        assert!(!lb.has_pending_writes());
        assert!(lb.round_id().is_none());
    }

    #[test]
    fn test_begin_conflicts_with_other_round() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);

        lb.begin_changes("req1").unwrap();
        lb.begin_changes("req1").unwrap();
        let err = lb.begin_changes("req2").unwrap_err();
        assert_eq!(err.kind, RoundErrorKind::RoundConflict);
    }

    #[test]
    fn test_commit_without_pending_writes_is_noop() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);

        lb.begin_changes("req1").unwrap();
        lb.commit_changes("req1").unwrap();
        lb.commit_changes("req1").unwrap();

        assert_eq!(primary.commits(), 0);
    }

    #[test]
    fn test_finalize_leaves_newly_enqueued_work_for_next_call() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        lb.begin_changes("req1").unwrap();

        lb.on_pre_commit("outer", |lb| {
            lb.execute_write("UPDATE counters SET n = n + 1")
                .map_err(|e| CallbackError::new("outer", e.message))?;
            lb.on_pre_commit("inner", |_| Ok(()))
        })
        .unwrap();

        assert_eq!(lb.finalize_changes("req1").unwrap(), 1);
        assert_eq!(lb.queued_hooks(HookPhase::PreCommit), 1);
        assert_eq!(lb.finalize_changes("req1").unwrap(), 1);
        assert_eq!(lb.finalize_changes("req1").unwrap(), 0);
        assert!(lb.has_pending_writes());
    }

    #[test]
    fn test_pre_commit_runs_immediately_without_round() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        lb.on_pre_commit("now", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(lb.queued_hooks(HookPhase::PreCommit), 0);
    }

    #[test]
    fn test_approval_refuses_failed_write() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        lb.begin_changes("req1").unwrap();

        primary.fail_next_statement("duplicate key");
        assert!(lb.execute_write("INSERT INTO t VALUES (1)").is_err());

        let err = lb.approve_changes(&CommitOptions::default(), "req1").unwrap_err();
        assert_eq!(err.kind, RoundErrorKind::ApprovalFailure);
        assert!(err.message.contains("duplicate key"));
    }

    #[test]
    fn test_approval_enforces_write_duration() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        lb.begin_changes("req1").unwrap();
        lb.execute_write("INSERT INTO t VALUES (1)").unwrap();
        lb.write_time = Duration::from_secs(5);

        let options = CommitOptions::with_max_write_duration(Duration::from_secs(1));
        let err = lb.approve_changes(&options, "req1").unwrap_err();
        assert_eq!(err.kind, RoundErrorKind::ApprovalFailure);
        assert!(lb.approve_changes(&CommitOptions::default(), "req1").is_ok());
    }

    #[test]
    fn test_approval_rejects_other_round() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        lb.begin_changes("req1").unwrap();

        let err = lb.approve_changes(&CommitOptions::default(), "req2").unwrap_err();
        assert_eq!(err.kind, RoundErrorKind::RoundMismatch);
    }

    #[test]
    fn test_commit_failure_rolls_back_and_reports() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        lb.begin_changes("req1").unwrap();
        lb.execute_write("INSERT INTO t VALUES (1)").unwrap();

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        lb.on_idle("observer", move |_, outcome| {
            *slot.lock().unwrap() = Some(outcome);
            Ok(())
        })
        .unwrap();

        primary.fail_next_commit("connection reset");
        let err = lb.commit_changes("req1").unwrap_err();
        assert_eq!(err.kind, RoundErrorKind::CommitFailure);
        assert_eq!(primary.rollbacks(), 1);
        assert_eq!(primary.position(), 0);

        lb.run_idle_callbacks("req1").unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(TransactionOutcome::RolledBack));
    }

    #[test]
    fn test_rollback_discards_pre_commit_work() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        lb.begin_changes("req1").unwrap();
        lb.execute_write("INSERT INTO t VALUES (1)").unwrap();
        lb.on_pre_commit("never", |_| Ok(())).unwrap();

        lb.rollback_changes("req1");

        assert_eq!(lb.queued_hooks(HookPhase::PreCommit), 0);
        assert_eq!(primary.rollbacks(), 1);
        assert!(!lb.has_pending_writes());
        assert!(!lb.has_or_made_recent_writes());
    }

    #[test]
    fn test_idle_callbacks_all_run_first_error_wins() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        lb.begin_changes("req1").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        lb.on_idle("a", |_, _| Err(CallbackError::new("a", "first"))).unwrap();
        lb.on_idle("b", |_, _| Err(CallbackError::new("b", "second"))).unwrap();
        let counter = Arc::clone(&ran);
        lb.on_idle("c", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        lb.commit_changes("req1").unwrap();
        let err = lb.run_idle_callbacks("req1").unwrap_err();

        assert_eq!(err.caller, "a");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(lb.queued_hooks(HookPhase::PostResolution), 0);
    }

    #[test]
    fn test_listeners_are_persistent_and_replaceable() {
        let primary = MemoryNode::new("db1");
        let mut lb = balancer(&primary, &[]);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&calls);
        lb.set_listener("audit", move |r| {
            log.lock().unwrap().push((r.round.clone(), r.outcome));
            Ok(())
        });

        lb.begin_changes("req1").unwrap();
        lb.commit_changes("req1").unwrap();
        lb.run_listener_callbacks("req1").unwrap();

        lb.begin_changes("req2").unwrap();
        lb.rollback_changes("req2");
        lb.run_listener_callbacks("req2").unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ("req1".to_string(), TransactionOutcome::Committed),
                ("req2".to_string(), TransactionOutcome::RolledBack),
            ]
        );

        assert!(lb.clear_listener("audit"));
        assert!(!lb.clear_listener("audit"));
    }

    #[test]
    fn test_wait_for_all_succeeds_when_replicas_catch_up() {
        let primary = MemoryNode::at_position("db1", 42);
        let replica = MemoryNode::at_position("db2", 40);
        replica.advance_on_poll(1);
        let mut lb = balancer(&primary, &[&replica]);

        assert!(lb.wait_for_all(ReplicationPosition::new(42), Duration::from_secs(1)));
        assert!(!lb.is_lagged());
        assert_eq!(replica.position_queries(), 2);
    }

    #[test]
    fn test_wait_for_all_times_out() {
        let primary = MemoryNode::at_position("db1", 42);
        let replica = MemoryNode::at_position("db2", 10);
        let mut lb = balancer(&primary, &[&replica]);

        assert!(!lb.wait_for_all(ReplicationPosition::new(42), Duration::from_millis(20)));
        assert!(lb.is_lagged());
    }

    #[test]
    fn test_reads_prefer_replicas_unless_pinned() {
        let primary = MemoryNode::new("db1");
        let replica = MemoryNode::new("db2");
        let mut lb = balancer(&primary, &[&replica]);

        lb.execute_read("SELECT 1").unwrap();
        assert_eq!(replica.statements().len(), 1);
        assert!(primary.statements().is_empty());

        lb.pin_to_primary();
        lb.execute_read("SELECT 2").unwrap();
        assert_eq!(primary.statements(), vec!["SELECT 2".to_string()]);
    }

    #[test]
    fn test_reads_inside_open_transaction_use_primary() {
        let primary = MemoryNode::new("db1");
        let replica = MemoryNode::new("db2");
        let mut lb = balancer(&primary, &[&replica]);

        lb.begin_changes("req1").unwrap();
        lb.execute_write("INSERT INTO t VALUES (1)").unwrap();
        lb.execute_read("SELECT * FROM t").unwrap();

        assert!(replica.statements().is_empty());
        assert_eq!(primary.statements().len(), 2);
    }

    #[test]
    fn test_read_falls_back_to_primary() {
        let primary = MemoryNode::new("db1");
        let replica = MemoryNode::new("db2");
        let mut lb = balancer(&primary, &[&replica]);

        replica.fail_next_statement("replica down");
        lb.execute_read("SELECT 1").unwrap();

        assert_eq!(primary.statements(), vec!["SELECT 1".to_string()]);
    }

    #[test]
    fn test_writer_identifier_is_primary_name() {
        let primary = MemoryNode::new("db1");
        let lb = balancer(&primary, &[]);
        assert_eq!(lb.writer_identifier(), "db1");
    }
}
