//! clusterround - coordinated transaction rounds across replicated database clusters
//!
//! One logical unit of work may write to several clusters. The round
//! coordinator drives every cluster's load balancer through the same global
//! phase sequence (finalize, approve, commit, post-commit callbacks) so the
//! work commits or rolls back as a whole. The chronology tracker lets a client
//! observe its own writes on the next request even when that request lands on
//! a lagging replica.

pub mod balancer;
pub mod chronology;
pub mod config;
pub mod connection;
pub mod context;
pub mod domain;
pub mod lock;
pub mod observability;
pub mod round;
pub mod stash;
