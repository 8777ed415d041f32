//! Connection error types
//!
//! Errors raised by the database-facing collaborator. The coordinator never
//! inspects them beyond their message; integrity decisions are made one
//! layer up.

use thiserror::Error;

use crate::domain::DomainId;

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors surfaced by a connection or connection provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Provider has no cluster under this domain
    #[error("unknown domain: {0}")]
    UnknownDomain(DomainId),

    /// Node could not be reached
    #[error("server {server} unreachable: {message}")]
    Unreachable { server: String, message: String },

    /// Statement failed on the server
    #[error("statement failed on {server}: {message}")]
    Statement { server: String, message: String },

    /// BEGIN/COMMIT/ROLLBACK failed
    #[error("transaction control failed on {server}: {message}")]
    Transaction { server: String, message: String },

    /// Server cannot report a replication position
    #[error("replication position unavailable on {0}")]
    PositionUnavailable(String),
}
