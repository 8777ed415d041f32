//! Load balancers
//!
//! One load balancer per database cluster touched by a request. Each holds
//! the primary and replica handles, the open primary transaction of the
//! current round, and the hooks registered against that transaction.

mod callbacks;
mod load_balancer;

pub use callbacks::{
    CallbackError, CallbackResult, HookPhase, IdleHandler, ListenerHandler, PreCommitHandler,
    Resolution, TransactionOutcome,
};
pub use load_balancer::{BalancerSettings, CommitOptions, LoadBalancer};
