//! Stored client replication state
//!
//! Stash entry `chronology:v1:<clientId>`, JSON encoded:
//!
//! ```json
//! {
//!   "positions": {
//!     "main": { "position": 42, "recorded_at": "2026-10-17T09:30:00Z" }
//!   },
//!   "write_index": 3
//! }
//! ```
//!
//! A `null` position means the primary could not report one; reads for that
//! domain go to the primary instead of waiting.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::client::ClientId;
use crate::connection::ReplicationPosition;
use crate::domain::DomainId;

const KEY_PREFIX: &str = "chronology:v1:";

/// Stash key holding a client's state
pub fn state_key(client: &ClientId) -> String {
    format!("{}{}", KEY_PREFIX, client)
}

/// Last write position recorded for one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub position: Option<ReplicationPosition>,
    pub recorded_at: DateTime<Utc>,
}

impl PositionRecord {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.recorded_at.checked_add_signed(ttl))
            .is_some_and(|expiry| expiry < now)
    }
}

/// Everything stored for one client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPositions {
    #[serde(default)]
    pub positions: BTreeMap<DomainId, PositionRecord>,
    #[serde(default)]
    pub write_index: u64,
}

impl StoredPositions {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Drop records older than `ttl`.
    pub fn prune(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.positions.retain(|_, record| !record.is_expired(now, ttl));
    }

    /// Fold positions recorded by this request into the stored state.
    ///
    /// Per domain the later position wins. An unknown position wins over any
    /// known one, since only the primary is then safe to read from.
    pub fn merge(
        &mut self,
        recorded: &BTreeMap<DomainId, Option<ReplicationPosition>>,
        now: DateTime<Utc>,
    ) {
        for (domain, position) in recorded {
            let merged = match (self.positions.get(domain).map(|r| r.position), position) {
                (Some(Some(stored)), Some(new)) => Some(stored.max(*new)),
                (Some(None), _) | (_, None) => None,
                (None, Some(new)) => Some(*new),
            };
            self.positions.insert(
                domain.clone(),
                PositionRecord {
                    position: merged,
                    recorded_at: now,
                },
            );
        }
    }
}
