//! Phase hooks
//!
//! Hooks are a tagged list of `(phase, handler)` pairs kept in registration
//! order. The load balancer drains one phase at a time, at fixed points in
//! the round sequence:
//!
//! - `PreCommit`: drained by `finalize_changes`, before approval
//! - `PostResolution`: drained after commit or rollback is durable
//!
//! Listeners are separate: they are named, persistent and invoked after every
//! resolution instead of once.

use std::fmt;

use thiserror::Error;

use super::LoadBalancer;
use crate::domain::DomainId;

/// Result type for hook handlers
pub type CallbackResult = Result<(), CallbackError>;

/// A hook handler reported failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("callback '{caller}' failed: {message}")]
pub struct CallbackError {
    /// Caller that registered the hook
    pub caller: String,
    /// Failure description
    pub message: String,
}

impl CallbackError {
    pub fn new(caller: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            message: message.into(),
        }
    }
}

/// How a transaction on one load balancer was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

impl TransactionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook phases, in the order a round drains them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreCommit,
    PostResolution,
}

/// Pre-commit work. May write through the load balancer and may enqueue
/// further pre-commit work.
pub type PreCommitHandler = Box<dyn FnOnce(&mut LoadBalancer) -> CallbackResult + Send>;

/// Work that runs once the transaction is resolved.
pub type IdleHandler =
    Box<dyn FnOnce(&mut LoadBalancer, TransactionOutcome) -> CallbackResult + Send>;

/// Persistent listener invoked after every resolution.
pub type ListenerHandler = Box<dyn Fn(&Resolution) -> CallbackResult + Send>;

/// What a listener is told about a resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub domain: DomainId,
    pub round: String,
    pub outcome: TransactionOutcome,
}

pub(crate) enum HookHandler {
    PreCommit(PreCommitHandler),
    PostResolution(IdleHandler),
}

pub(crate) struct Hook {
    pub(crate) caller: String,
    pub(crate) handler: HookHandler,
}

impl Hook {
    pub(crate) fn phase(&self) -> HookPhase {
        match self.handler {
            HookHandler::PreCommit(_) => HookPhase::PreCommit,
            HookHandler::PostResolution(_) => HookPhase::PostResolution,
        }
    }
}

/// Registered hooks in registration order.
#[derive(Default)]
pub(crate) struct HookList {
    hooks: Vec<Hook>,
}

impl HookList {
    pub(crate) fn push(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    /// Remove and return every hook of `phase`, keeping order.
    pub(crate) fn take(&mut self, phase: HookPhase) -> Vec<Hook> {
        let (taken, kept) = std::mem::take(&mut self.hooks)
            .into_iter()
            .partition(|hook| hook.phase() == phase);
        self.hooks = kept;
        taken
    }

    pub(crate) fn count(&self, phase: HookPhase) -> usize {
        self.hooks.iter().filter(|hook| hook.phase() == phase).count()
    }
}

pub(crate) struct Listener {
    pub(crate) name: String,
    pub(crate) handler: ListenerHandler,
}
