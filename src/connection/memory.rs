//! In-memory simulated clusters
//!
//! A `MemoryNode` is a shared, inspectable stand-in for one database server.
//! Every `MemoryConnection` opened on it is a separate session: transactions
//! are per session, advisory locks and the replication position are per node.
//! A session may take the same lock again; it stays held until every
//! acquisition is released.
//!
//! Nodes count every call they receive and can be told to fail the next
//! statement or commit, which is how the coordinator's failure paths are
//! exercised in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    deadline_after, share, Connection, ConnectionError, ConnectionProvider, ConnectionResult, QueryOutcome,
    ReplicationPosition, SharedConnection,
};
use crate::domain::DomainId;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

const LOCK_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct NodeState {
    position: u64,
    advance_per_poll: u64,
    statements: Vec<String>,
    begins: usize,
    commits: usize,
    rollbacks: usize,
    position_queries: usize,
    /// lock name → (holding session, acquisition count)
    locks: HashMap<String, (u64, usize)>,
    fail_next_statement: Option<String>,
    fail_next_commit: Option<String>,
    position_unavailable: bool,
}

/// One simulated database server.
#[derive(Debug, Clone)]
pub struct MemoryNode {
    name: String,
    state: Arc<Mutex<NodeState>>,
}

impl MemoryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(NodeState::default())),
        }
    }

    /// Start the node at a given position.
    pub fn at_position(name: impl Into<String>, position: u64) -> Self {
        let node = Self::new(name);
        node.set_position(position);
        node
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a new session on this node.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            node: self.clone(),
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            in_trx: false,
            trx_writes: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.state().position
    }

    pub fn set_position(&self, position: u64) {
        self.state().position = position;
    }

    /// Make the node's position grow by `step` every time it is queried,
    /// simulating a replica catching up while someone waits on it.
    pub fn advance_on_poll(&self, step: u64) {
        self.state().advance_per_poll = step;
    }

    pub fn fail_next_statement(&self, message: impl Into<String>) {
        self.state().fail_next_statement = Some(message.into());
    }

    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.state().fail_next_commit = Some(message.into());
    }

    pub fn set_position_unavailable(&self, unavailable: bool) {
        self.state().position_unavailable = unavailable;
    }

    pub fn begins(&self) -> usize {
        self.state().begins
    }

    pub fn commits(&self) -> usize {
        self.state().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }

    pub fn position_queries(&self) -> usize {
        self.state().position_queries
    }

    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.state().locks.contains_key(name)
    }
}

fn is_write(statement: &str) -> bool {
    let head = statement
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "CREATE" | "DROP" | "ALTER"
    )
}

/// One session on a `MemoryNode`.
#[derive(Debug)]
pub struct MemoryConnection {
    node: MemoryNode,
    session: u64,
    in_trx: bool,
    trx_writes: u64,
}

impl MemoryConnection {
    pub fn node(&self) -> &MemoryNode {
        &self.node
    }

    pub fn in_transaction(&self) -> bool {
        self.in_trx
    }
}

impl Connection for MemoryConnection {
    fn server_name(&self) -> &str {
        &self.node.name
    }

    fn begin(&mut self, _caller: &str) -> ConnectionResult<()> {
        if self.in_trx {
            return Err(ConnectionError::Transaction {
                server: self.node.name.clone(),
                message: "transaction already open".to_string(),
            });
        }
        self.node.state().begins += 1;
        self.in_trx = true;
        self.trx_writes = 0;
        Ok(())
    }

    fn commit(&mut self, _caller: &str) -> ConnectionResult<()> {
        let mut state = self.node.state();
        if let Some(message) = state.fail_next_commit.take() {
            return Err(ConnectionError::Transaction {
                server: self.node.name.clone(),
                message,
            });
        }
        if !self.in_trx {
            return Err(ConnectionError::Transaction {
                server: self.node.name.clone(),
                message: "no transaction open".to_string(),
            });
        }
        state.commits += 1;
        state.position += self.trx_writes;
        drop(state);

        self.in_trx = false;
        self.trx_writes = 0;
        Ok(())
    }

    fn rollback(&mut self, _caller: &str) -> ConnectionResult<()> {
        self.node.state().rollbacks += 1;
        self.in_trx = false;
        self.trx_writes = 0;
        Ok(())
    }

    fn execute(&mut self, statement: &str) -> ConnectionResult<QueryOutcome> {
        let mut state = self.node.state();
        if let Some(message) = state.fail_next_statement.take() {
            return Err(ConnectionError::Statement {
                server: self.node.name.clone(),
                message,
            });
        }
        state.statements.push(statement.to_string());

        if !is_write(statement) {
            return Ok(QueryOutcome::default());
        }
        if self.in_trx {
            self.trx_writes += 1;
        } else {
            state.position += 1;
        }
        Ok(QueryOutcome {
            affected_rows: 1,
            rows: Vec::new(),
        })
    }

    fn replication_position(&mut self) -> ConnectionResult<ReplicationPosition> {
        let mut state = self.node.state();
        state.position_queries += 1;
        if state.position_unavailable {
            return Err(ConnectionError::PositionUnavailable(self.node.name.clone()));
        }
        state.position += state.advance_per_poll;
        Ok(ReplicationPosition::new(state.position))
    }

    fn try_lock(&mut self, name: &str, timeout: Duration) -> ConnectionResult<bool> {
        let deadline = deadline_after(timeout);
        loop {
            {
                let mut state = self.node.state();
                match state.locks.get_mut(name) {
                    Some((holder, _)) if *holder != self.session => {}
                    Some((_, count)) => {
                        *count += 1;
                        return Ok(true);
                    }
                    None => {
                        state.locks.insert(name.to_string(), (self.session, 1));
                        return Ok(true);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(LOCK_POLL);
        }
    }

    fn unlock(&mut self, name: &str) -> ConnectionResult<bool> {
        let mut state = self.node.state();
        match state.locks.get_mut(name) {
            Some((holder, count)) if *holder == self.session => {
                *count -= 1;
                if *count == 0 {
                    state.locks.remove(name);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Provider over a fixed set of simulated clusters.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    clusters: HashMap<DomainId, (MemoryNode, Vec<MemoryNode>)>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster under `domain`.
    pub fn with_cluster(
        mut self,
        domain: impl Into<DomainId>,
        primary: MemoryNode,
        replicas: Vec<MemoryNode>,
    ) -> Self {
        self.clusters.insert(domain.into(), (primary, replicas));
        self
    }

    fn cluster(&self, domain: &DomainId) -> ConnectionResult<&(MemoryNode, Vec<MemoryNode>)> {
        self.clusters
            .get(domain)
            .ok_or_else(|| ConnectionError::UnknownDomain(domain.clone()))
    }
}

impl ConnectionProvider for MemoryProvider {
    fn primary(&self, domain: &DomainId) -> ConnectionResult<SharedConnection> {
        let (primary, _) = self.cluster(domain)?;
        Ok(share(primary.connect()))
    }

    fn replicas(&self, domain: &DomainId) -> ConnectionResult<Vec<SharedConnection>> {
        let (_, replicas) = self.cluster(domain)?;
        Ok(replicas.iter().map(|node| share(node.connect())).collect())
    }
}
