//! Named advisory locks
//!
//! A lock is scoped to `(domain, purpose, key)` and taken on a primary
//! session. Acquisition is bounded by a timeout and returns `None` instead of
//! failing; the caller decides how to proceed. The returned `ScopedLock`
//! releases on drop, including on error paths, and releasing twice is a no-op.
//!
//! Locks are never held across process boundaries. Taking the same lock
//! twice on one session nests: the lock stays held until both are released.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::connection::{lock_connection, SharedConnection};
use crate::domain::DomainId;
use crate::observability::{Event, Logger, MetricsRegistry};

/// Longest lock name passed to the database as is
pub const MAX_LOCK_NAME_LEN: usize = 64;

const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Engine-safe lock name for `(domain, purpose, key)`.
///
/// Names longer than `MAX_LOCK_NAME_LEN` bytes are replaced by a digest so
/// that every engine accepts them.
pub fn lock_name(domain: &DomainId, purpose: &str, key: &str) -> String {
    let name = format!("{}:{}:{}", domain, purpose, key);
    if name.len() <= MAX_LOCK_NAME_LEN {
        return name;
    }

    let digest = Sha256::digest(name.as_bytes());
    let mut hashed = String::from("lock:");
    for byte in &digest[..24] {
        let _ = write!(hashed, "{:02x}", byte);
    }
    hashed
}

/// What to lock and for how long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub purpose: String,
    pub key: String,
    /// Who takes the lock, for log lines
    pub acquirer: String,
    /// Longest wait for the lock; zero tries once
    pub timeout: Duration,
    /// Expected longest hold; holding longer is logged
    pub ttl: Duration,
}

impl LockRequest {
    pub fn new(purpose: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            key: key.into(),
            acquirer: String::from("anonymous"),
            timeout: Duration::ZERO,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_acquirer(mut self, acquirer: impl Into<String>) -> Self {
        self.acquirer = acquirer.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// A held advisory lock. Released on drop.
pub struct ScopedLock {
    name: String,
    acquirer: String,
    ttl: Duration,
    acquired_at: Instant,
    connection: SharedConnection,
    released: bool,
}

impl ScopedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquirer(&self) -> &str {
        &self.acquirer
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the lock. Returns false if it was already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        let held = self.held_for();
        let held_ms = held.as_millis().to_string();
        if held > self.ttl {
            let ttl_ms = self.ttl.as_millis().to_string();
            Logger::emit(
                Event::LockOverdue,
                &[
                    ("acquirer", &self.acquirer),
                    ("held_ms", &held_ms),
                    ("lock", &self.name),
                    ("ttl_ms", &ttl_ms),
                ],
            );
        }

        let result = lock_connection(&self.connection).unlock(&self.name);
        match result {
            Ok(true) => Logger::emit(
                Event::LockReleased,
                &[("held_ms", &held_ms), ("lock", &self.name)],
            ),
            Ok(false) => Logger::emit(
                Event::LockReleaseFailed,
                &[("error", "lock not held by this session"), ("lock", &self.name)],
            ),
            Err(err) => Logger::emit(
                Event::LockReleaseFailed,
                &[("error", &err.to_string()), ("lock", &self.name)],
            ),
        }
        true
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Take the named lock on `connection`, waiting at most `request.timeout`.
///
/// Returns `None` when the lock is unavailable in time or the connection
/// fails; both are logged.
pub fn acquire_named_lock(
    connection: &SharedConnection,
    domain: &DomainId,
    request: &LockRequest,
    metrics: &MetricsRegistry,
) -> Option<ScopedLock> {
    let name = lock_name(domain, &request.purpose, &request.key);
    let result = lock_connection(connection).try_lock(&name, request.timeout);

    match result {
        Ok(true) => {
            metrics.increment_locks_acquired();
            Logger::emit(
                Event::LockAcquired,
                &[("acquirer", &request.acquirer), ("lock", &name)],
            );
            Some(ScopedLock {
                name,
                acquirer: request.acquirer.clone(),
                ttl: request.ttl,
                acquired_at: Instant::now(),
                connection: Arc::clone(connection),
                released: false,
            })
        }
        Ok(false) => {
            let waited = request.timeout.as_millis().to_string();
            metrics.increment_lock_timeouts();
            Logger::emit(
                Event::LockTimeout,
                &[
                    ("acquirer", &request.acquirer),
                    ("lock", &name),
                    ("timeout_ms", &waited),
                ],
            );
            None
        }
        Err(err) => {
            metrics.increment_lock_timeouts();
            Logger::emit(
                Event::LockTimeout,
                &[
                    ("acquirer", &request.acquirer),
                    ("error", &err.to_string()),
                    ("lock", &name),
                ],
            );
            None
        }
    }
}
