//! Named Lock Tests
//!
//! - Locks are scoped to (domain, purpose, key)
//! - Contended acquisition returns None after the timeout
//! - Locks release on every exit path, including errors

use std::sync::Arc;
use std::time::Duration;

use clusterround::config::CoordinatorConfig;
use clusterround::connection::memory::{MemoryNode, MemoryProvider};
use clusterround::lock::{lock_name, LockRequest};
use clusterround::observability::MetricsRegistry;
use clusterround::round::{RoundCoordinator, RoundError, RoundResult};

fn coordinator(provider: &MemoryProvider) -> RoundCoordinator {
    RoundCoordinator::new(
        Arc::new(provider.clone()),
        &CoordinatorConfig::default(),
        Arc::new(MetricsRegistry::new()),
    )
    .unwrap()
}

fn provider(main: &MemoryNode, archive: &MemoryNode) -> MemoryProvider {
    MemoryProvider::new()
        .with_cluster("main", main.clone(), vec![])
        .with_cluster("archive", archive.clone(), vec![])
}

// =============================================================================
// Contention
// =============================================================================

/// A second request cannot take a lock the first one holds.
#[test]
fn test_lock_excludes_other_requests() {
    let main = MemoryNode::new("main-db1");
    let archive = MemoryNode::new("archive-db1");
    let clusters = provider(&main, &archive);
    let mut first = coordinator(&clusters);
    let mut second = coordinator(&clusters);
    let request = LockRequest::new("purge", "page:42").with_timeout(Duration::from_millis(10));

    let held = first
        .load_balancer("main")
        .unwrap()
        .acquire_named_lock(&request)
        .unwrap();
    assert!(main.is_locked(held.name()));

    let blocked = second
        .load_balancer("main")
        .unwrap()
        .acquire_named_lock(&request);
    assert!(blocked.is_none());
    assert_eq!(second.metrics().snapshot().lock_timeouts, 1);

    drop(held);
    let taken = second
        .load_balancer("main")
        .unwrap()
        .acquire_named_lock(&request);
    assert!(taken.is_some());
}

/// The same purpose and key on another domain is a different lock.
#[test]
fn test_locks_scoped_by_domain() {
    let main = MemoryNode::new("main-db1");
    let archive = MemoryNode::new("archive-db1");
    let mut coord = coordinator(&provider(&main, &archive));
    let request = LockRequest::new("purge", "page:42");

    let _main_lock = coord
        .load_balancer("main")
        .unwrap()
        .acquire_named_lock(&request)
        .unwrap();
    let archive_lock = coord
        .load_balancer("archive")
        .unwrap()
        .acquire_named_lock(&request)
        .unwrap();

    assert_eq!(archive_lock.name(), "archive:purge:page:42");
    assert!(archive.is_locked("archive:purge:page:42"));
    assert!(!main.is_locked("archive:purge:page:42"));
}

// =============================================================================
// Release
// =============================================================================

fn purge_page(coord: &mut RoundCoordinator, fail: bool) -> RoundResult<()> {
    let request = LockRequest::new("purge", "page:7").with_acquirer("purger");
    let lb = coord.load_balancer("main")?;
    let _lock = lb.acquire_named_lock(&request);
    lb.execute_write("DELETE FROM cache WHERE page = 7")?;
    if fail {
        return Err(RoundError::approval_failure("purge refused"));
    }
    Ok(())
}

/// The lock is gone after the holder returns an error.
#[test]
fn test_lock_released_on_error_path() {
    let main = MemoryNode::new("main-db1");
    let archive = MemoryNode::new("archive-db1");
    let mut coord = coordinator(&provider(&main, &archive));
    let name = lock_name(&"main".into(), "purge", "page:7");

    assert!(purge_page(&mut coord, true).is_err());
    assert!(!main.is_locked(&name));

    purge_page(&mut coord, false).unwrap();
    assert!(!main.is_locked(&name));
    assert_eq!(coord.metrics().snapshot().locks_acquired, 2);
}

/// A failing statement propagated with `?` also releases the lock.
#[test]
fn test_lock_released_when_statement_fails() {
    let main = MemoryNode::new("main-db1");
    let archive = MemoryNode::new("archive-db1");
    let mut coord = coordinator(&provider(&main, &archive));
    let name = lock_name(&"main".into(), "purge", "page:7");

    main.fail_next_statement("table is read-only");
    assert!(purge_page(&mut coord, false).is_err());
    assert!(!main.is_locked(&name));
}
