//! Chronology protection
//!
//! Gives a client that just wrote data a consistent view of that write on
//! its next request, even when that request reads from a replica that has
//! not caught up yet.
//!
//! Flow across two requests of the same client:
//!
//! 1. request N writes to domain `main`; at shutdown the primary position of
//!    `main` is recorded and persisted to the shared stash, and a client
//!    token `<writeIndex>@<timestamp>#<clientId>` is returned
//! 2. request N+1 carries the token; when it first opens `main`, reads wait
//!    for replicas to reach the recorded position (or go to the primary)
//!
//! Domains the client never wrote to are never waited on.

mod client;
mod state;
mod tracker;

pub use client::{ClientId, ClientRequest, ClientToken};
pub use state::{state_key, PositionRecord, StoredPositions};
pub use tracker::{ApplyOutcome, ChronologyTracker, PersistOutcome};
