//! Transaction rounds
//!
//! A round is one top-level unit of work spanning possibly many clusters,
//! committed or rolled back together. The coordinator drives every load
//! balancer through the same phases:
//!
//! ```text
//! begin ─> finalize* ─> approve ─> commit ─> idle callbacks ─> listeners
//!                 │          │
//!                 └──────────┴─> rollback ─> idle callbacks ─> listeners
//! ```
//!
//! Ownership tickets let a caller that did not open the round commit it on
//! the owner's behalf, provided nothing was pending when the ticket was
//! issued.

mod coordinator;
mod errors;
mod stage;
mod ticket;

pub use coordinator::RoundCoordinator;
pub use errors::{RoundError, RoundErrorKind, RoundResult};
pub use stage::RoundStage;
pub use ticket::{OwnershipTicket, ReplicationWaitOptions, TicketedCommit};

pub use crate::balancer::CommitOptions;
