//! Round Commit Protocol Tests
//!
//! - At most one round is open at a time
//! - No load balancer commits unless every load balancer passed approval
//! - The finalize sweep drains cascading pre-commit work exactly once
//! - Post-commit callbacks all run; the first failure surfaces afterwards
//! - Failures after the durable point never undo committed writes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use clusterround::balancer::{CallbackError, LoadBalancer, TransactionOutcome};
use clusterround::config::CoordinatorConfig;
use clusterround::connection::memory::{MemoryNode, MemoryProvider};
use clusterround::observability::MetricsRegistry;
use clusterround::round::{CommitOptions, RoundCoordinator, RoundErrorKind, RoundStage};

struct Cluster {
    primary: MemoryNode,
    replica: MemoryNode,
}

impl Cluster {
    fn new(name: &str) -> Self {
        Self {
            primary: MemoryNode::new(format!("{}-primary", name)),
            replica: MemoryNode::new(format!("{}-replica", name)),
        }
    }
}

fn coordinator(clusters: &[(&str, &Cluster)]) -> RoundCoordinator {
    let provider = clusters.iter().fold(MemoryProvider::new(), |p, (name, c)| {
        p.with_cluster(*name, c.primary.clone(), vec![c.replica.clone()])
    });
    let config = CoordinatorConfig {
        replica_poll_interval_ms: 1,
        ..CoordinatorConfig::default()
    };
    RoundCoordinator::new(Arc::new(provider), &config, Arc::new(MetricsRegistry::new())).unwrap()
}

fn write(coord: &mut RoundCoordinator, domain: &str, statement: &str) {
    coord
        .load_balancer(domain)
        .unwrap()
        .execute_write(statement)
        .unwrap();
}

// =============================================================================
// Round Exclusivity
// =============================================================================

/// A second, differently named round cannot begin while one is open.
#[test]
fn test_second_round_conflicts() {
    let a = Cluster::new("a");
    let mut coord = coordinator(&[("a", &a)]);

    coord.begin_round("req1").unwrap();
    let err = coord.begin_round("req2").unwrap_err();

    assert_eq!(err.kind, RoundErrorKind::RoundConflict);
    assert!(err.is_integrity_failure());
    assert_eq!(coord.round_name(), Some("req1"));
}

/// After a round commits, a new round may begin.
#[test]
fn test_rounds_are_sequential() {
    let a = Cluster::new("a");
    let mut coord = coordinator(&[("a", &a)]);

    coord.begin_round("req1").unwrap();
    write(&mut coord, "a", "INSERT INTO t VALUES (1)");
    coord.commit_round("req1", &CommitOptions::default()).unwrap();

    coord.begin_round("req2").unwrap();
    write(&mut coord, "a", "INSERT INTO t VALUES (2)");
    coord.commit_round("req2", &CommitOptions::default()).unwrap();

    assert_eq!(a.primary.commits(), 2);
    assert_eq!(a.primary.position(), 2);
}

/// Committing on a load balancer with nothing pending is a no-op.
#[test]
fn test_commit_without_writes_is_noop() {
    let a = Cluster::new("a");
    let mut coord = coordinator(&[("a", &a)]);

    coord.begin_round("req1").unwrap();
    coord.load_balancer("a").unwrap();
    coord.commit_round("req1", &CommitOptions::default()).unwrap();

    assert_eq!(a.primary.begins(), 0);
    assert_eq!(a.primary.commits(), 0);
    assert_eq!(coord.stage(), RoundStage::Idle);
}

// =============================================================================
// All-or-Nothing Admission
// =============================================================================

/// Both load balancers have pending writes and B refuses approval: neither
/// commits and the coordinator is back to Idle.
#[test]
fn test_approval_failure_commits_nothing() {
    let a = Cluster::new("a");
    let b = Cluster::new("b");
    let mut coord = coordinator(&[("a", &a), ("b", &b)]);

    coord.begin_round("req1").unwrap();
    write(&mut coord, "a", "INSERT INTO orders VALUES (1)");
    write(&mut coord, "b", "INSERT INTO ledger VALUES (1)");

    b.primary.fail_next_statement("deadlock detected");
    assert!(coord
        .load_balancer("b")
        .unwrap()
        .execute_write("UPDATE ledger SET total = total + 1")
        .is_err());

    let err = coord.commit_round("req1", &CommitOptions::default()).unwrap_err();

    assert_eq!(err.kind, RoundErrorKind::ApprovalFailure);
    assert_eq!(a.primary.commits(), 0);
    assert_eq!(b.primary.commits(), 0);
    assert_eq!(a.primary.rollbacks(), 1);
    assert_eq!(b.primary.rollbacks(), 1);
    assert_eq!(a.primary.position(), 0);
    assert_eq!(coord.stage(), RoundStage::Idle);
    assert!(coord.round_name().is_none());
    assert_eq!(coord.metrics().snapshot().approval_failures, 1);
}

/// Idle callbacks registered in an aborted round see the rollback.
#[test]
fn test_aborted_round_reports_rollback_to_callbacks() {
    let a = Cluster::new("a");
    let b = Cluster::new("b");
    let mut coord = coordinator(&[("a", &a), ("b", &b)]);
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    coord.begin_round("req1").unwrap();
    write(&mut coord, "a", "INSERT INTO t VALUES (1)");
    let seen = Arc::clone(&outcomes);
    coord
        .load_balancer("a")
        .unwrap()
        .on_idle("cache", move |_, outcome| {
            seen.lock().unwrap().push(outcome);
            Ok(())
        })
        .unwrap();
    coord
        .load_balancer("b")
        .unwrap()
        .on_pre_commit("validator", |_| Err(CallbackError::new("validator", "bad row")))
        .unwrap();

    let err = coord.commit_round("req1", &CommitOptions::default()).unwrap_err();

    assert_eq!(err.kind, RoundErrorKind::PreCommitFailure);
    assert_eq!(*outcomes.lock().unwrap(), vec![TransactionOutcome::RolledBack]);
    assert_eq!(a.primary.commits(), 0);
}

// =============================================================================
// Finalize Sweep
// =============================================================================

fn chain(lb: &mut LoadBalancer, remaining: usize, runs: Arc<AtomicUsize>) -> Result<(), CallbackError> {
    runs.fetch_add(1, Ordering::SeqCst);
    lb.execute_write("INSERT INTO audit VALUES (1)")
        .map_err(|e| CallbackError::new("chain", e.message))?;
    if remaining == 0 {
        return Ok(());
    }
    lb.on_pre_commit("chain", move |lb| chain(lb, remaining - 1, runs))
}

/// Each unit of pre-commit work enqueues one more; every unit runs exactly
/// once and the sweep terminates.
#[test]
fn test_finalize_sweep_drains_cascading_work() {
    let a = Cluster::new("a");
    let b = Cluster::new("b");
    let mut coord = coordinator(&[("a", &a), ("b", &b)]);
    let runs_a = Arc::new(AtomicUsize::new(0));
    let runs_b = Arc::new(AtomicUsize::new(0));

    coord.begin_round("req1").unwrap();
    let counter = Arc::clone(&runs_a);
    coord
        .load_balancer("a")
        .unwrap()
        .on_pre_commit("chain", move |lb| chain(lb, 4, counter))
        .unwrap();
    let counter = Arc::clone(&runs_b);
    coord
        .load_balancer("b")
        .unwrap()
        .on_pre_commit("chain", move |lb| chain(lb, 1, counter))
        .unwrap();

    coord.commit_round("req1", &CommitOptions::default()).unwrap();

    assert_eq!(runs_a.load(Ordering::SeqCst), 5);
    assert_eq!(runs_b.load(Ordering::SeqCst), 2);
    assert_eq!(a.primary.position(), 5);
    assert_eq!(b.primary.position(), 2);
    assert_eq!(a.primary.commits(), 1);
}

// =============================================================================
// Post-Commit Callbacks
// =============================================================================

/// Callback A fails, callback B succeeds: both run, A's error surfaces, and
/// the writes stay committed.
#[test]
fn test_first_callback_error_surfaces_after_all_ran() {
    let a = Cluster::new("a");
    let mut coord = coordinator(&[("a", &a)]);
    let b_outcome = Arc::new(Mutex::new(None));

    coord.begin_round("req1").unwrap();
    write(&mut coord, "a", "INSERT INTO t VALUES (1)");
    let lb = coord.load_balancer("a").unwrap();
    lb.on_idle("A", |_, _| Err(CallbackError::new("A", "search index offline")))
        .unwrap();
    let slot = Arc::clone(&b_outcome);
    lb.on_idle("B", move |_, outcome| {
        *slot.lock().unwrap() = Some(outcome);
        Ok(())
    })
    .unwrap();

    let err = coord.commit_round("req1", &CommitOptions::default()).unwrap_err();

    assert_eq!(err.kind, RoundErrorKind::PostCommitCallback);
    assert!(err.message.contains("'A'"));
    assert!(err.after_durable_point());
    assert!(!err.is_integrity_failure());
    assert_eq!(*b_outcome.lock().unwrap(), Some(TransactionOutcome::Committed));
    assert_eq!(a.primary.commits(), 1);
    assert_eq!(a.primary.position(), 1);
    assert_eq!(coord.stage(), RoundStage::Idle);
}

/// Listeners on every load balancer hear about each resolution.
#[test]
fn test_listeners_run_on_every_balancer() {
    let a = Cluster::new("a");
    let b = Cluster::new("b");
    let mut coord = coordinator(&[("a", &a), ("b", &b)]);
    let heard = Arc::new(Mutex::new(Vec::new()));

    for domain in ["a", "b"] {
        let log = Arc::clone(&heard);
        coord
            .load_balancer(domain)
            .unwrap()
            .set_listener("audit", move |r| {
                log.lock()
                    .unwrap()
                    .push(format!("{}:{}:{}", r.domain, r.round, r.outcome));
                Ok(())
            });
    }

    coord.begin_round("req1").unwrap();
    coord.commit_round("req1", &CommitOptions::default()).unwrap();
    coord.begin_round("req2").unwrap();
    coord.rollback_round("req2").unwrap();

    assert_eq!(
        *heard.lock().unwrap(),
        vec![
            "a:req1:committed",
            "b:req1:committed",
            "a:req2:rolled_back",
            "b:req2:rolled_back",
        ]
    );
}

/// A commit failure on one primary is reported; the other primary stays
/// committed.
#[test]
fn test_commit_failure_after_durable_point() {
    let a = Cluster::new("a");
    let b = Cluster::new("b");
    let mut coord = coordinator(&[("a", &a), ("b", &b)]);

    coord.begin_round("req1").unwrap();
    write(&mut coord, "a", "INSERT INTO t VALUES (1)");
    write(&mut coord, "b", "INSERT INTO t VALUES (1)");
    b.primary.fail_next_commit("lost connection");

    let err = coord.commit_round("req1", &CommitOptions::default()).unwrap_err();

    assert_eq!(err.kind, RoundErrorKind::CommitFailure);
    assert_eq!(a.primary.position(), 1);
    assert_eq!(b.primary.position(), 0);
    assert_eq!(coord.stage(), RoundStage::Idle);
    assert_eq!(coord.metrics().snapshot().commit_failures, 1);
}

// =============================================================================
// Rollback
// =============================================================================

/// Rollback discards pending writes on every load balancer.
#[test]
fn test_rollback_round() {
    let a = Cluster::new("a");
    let b = Cluster::new("b");
    let mut coord = coordinator(&[("a", &a), ("b", &b)]);

    coord.begin_round("req1").unwrap();
    write(&mut coord, "a", "INSERT INTO t VALUES (1)");
    write(&mut coord, "b", "INSERT INTO t VALUES (1)");
    coord.rollback_round("req1").unwrap();

    assert_eq!(a.primary.position(), 0);
    assert_eq!(b.primary.position(), 0);
    assert!(!coord.has_pending_writes());
    assert_eq!(coord.metrics().snapshot().rounds_rolled_back, 1);
}

/// Aliases resolve to the same load balancer.
#[test]
fn test_aliases_share_a_balancer() {
    let a = Cluster::new("a");
    let provider = MemoryProvider::new().with_cluster("main", a.primary.clone(), vec![]);
    let config = CoordinatorConfig::from_json(r#"{"domain_aliases": {"wiki": "main"}}"#).unwrap();
    let mut coord =
        RoundCoordinator::new(Arc::new(provider), &config, Arc::new(MetricsRegistry::new()))
            .unwrap();

    coord.begin_round("req1").unwrap();
    write(&mut coord, "wiki", "INSERT INTO t VALUES (1)");
    write(&mut coord, "main", "INSERT INTO t VALUES (2)");
    coord.commit_round("req1", &CommitOptions::default()).unwrap();

    assert_eq!(coord.balancers().count(), 1);
    assert_eq!(a.primary.begins(), 1);
    assert_eq!(a.primary.position(), 2);
}
