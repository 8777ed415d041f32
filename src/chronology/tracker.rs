//! Chronology Tracker
//!
//! At request start, every load balancer the request opens is checked
//! against the positions the client last wrote: reads either wait for
//! replicas to catch up or go to the primary. At request end, the positions
//! written by this request are folded into the stash.
//!
//! Chronology protection is off for batch contexts and when the stash is a
//! no-op. Every stash failure degrades to possibly-stale reads, never to a
//! failed request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::client::{ClientId, ClientRequest, ClientToken};
use super::state::{state_key, StoredPositions};
use crate::balancer::LoadBalancer;
use crate::config::{ChronologyConfig, CoordinatorConfig, ReadStrategy};
use crate::connection::{deadline_after, ReplicationPosition};
use crate::domain::DomainId;
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::stash::{Stash, StashError, StashResult};

const STASH_POLL: Duration = Duration::from_millis(10);

/// What `apply_on_startup` did to a load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Chronology protection is disabled
    Skipped,
    /// The client has no recorded position for this domain
    NoPosition,
    /// Reads were pinned to the primary
    Pinned,
    /// Replicas were waited on
    Waited { caught_up: bool },
}

/// What `persist` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Disabled, or nothing was written during this request
    Skipped,
    /// State stored under this write index
    Saved { write_index: u64 },
}

enum TokenCheck {
    Absent,
    Fresh(ClientToken),
    Stale,
    Malformed,
}

/// Per-request chronology protection for one client.
pub struct ChronologyTracker {
    client: ClientId,
    token: Option<ClientToken>,
    /// The request carried an expired token; its positions are not loaded
    stale_token: bool,
    enabled: bool,
    stash: Arc<dyn Stash>,
    config: ChronologyConfig,
    wait_timeout: Duration,
    loaded: Option<StoredPositions>,
    recorded: BTreeMap<DomainId, Option<ReplicationPosition>>,
    metrics: Arc<MetricsRegistry>,
}

impl ChronologyTracker {
    /// Resolve the client identity and build the tracker.
    ///
    /// A fresh, well-formed token supplies the identity. Anything else is
    /// discarded and the identity is derived from the request. A stale token
    /// also means this request waits on nothing.
    pub fn new(
        request: &ClientRequest,
        stash: Arc<dyn Stash>,
        config: &CoordinatorConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let check = match request.chronology_token.as_deref() {
            Some(raw) => Self::check_token(raw, &config.chronology, &metrics),
            None => TokenCheck::Absent,
        };
        let stale_token = matches!(check, TokenCheck::Stale);
        let token = match check {
            TokenCheck::Fresh(token) => Some(token),
            _ => None,
        };
        let client = token
            .as_ref()
            .map(|t| t.client_id.clone())
            .unwrap_or_else(|| request.derived_client_id());

        Self {
            client,
            token,
            stale_token,
            enabled: config.chronology_active() && !stash.is_noop(),
            stash,
            config: config.chronology.clone(),
            wait_timeout: config.replication_wait_timeout(),
            loaded: None,
            recorded: BTreeMap::new(),
            metrics,
        }
    }

    fn check_token(raw: &str, config: &ChronologyConfig, metrics: &MetricsRegistry) -> TokenCheck {
        let (check, reason) = match ClientToken::parse(raw) {
            Some(token) if token.is_fresh(Utc::now(), config.token_ttl()) => {
                return TokenCheck::Fresh(token)
            }
            Some(_) => (TokenCheck::Stale, "stale"),
            None => (TokenCheck::Malformed, "malformed"),
        };
        metrics.increment_chronology_tokens_discarded();
        Logger::emit(
            Event::ChronologyTokenDiscarded,
            &[("reason", reason), ("token", raw)],
        );
        check
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client
    }

    /// Token accepted from the request, if any
    pub fn token(&self) -> Option<&ClientToken> {
        self.token.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // =========================================================================
    // REQUEST START
    // =========================================================================

    /// Make `lb` safe to read the client's own writes from.
    pub fn apply_on_startup(&mut self, lb: &mut LoadBalancer) -> ApplyOutcome {
        if !self.enabled {
            return ApplyOutcome::Skipped;
        }

        let record = match self.load().positions.get(lb.domain()) {
            Some(record) => record.clone(),
            None => return ApplyOutcome::NoPosition,
        };

        match (record.position, self.config.read_strategy) {
            (Some(position), ReadStrategy::WaitForReplicas) => {
                self.metrics.increment_chronology_waits();
                let caught_up = lb.wait_for_all(position, self.wait_timeout);
                ApplyOutcome::Waited { caught_up }
            }
            _ => {
                lb.pin_to_primary();
                self.metrics.increment_chronology_pins();
                Logger::emit(
                    Event::ChronologyPinned,
                    &[("client", self.client.as_str()), ("domain", lb.domain().as_str())],
                );
                ApplyOutcome::Pinned
            }
        }
    }

    fn load(&mut self) -> &StoredPositions {
        if self.loaded.is_none() {
            let fetched = if self.stale_token {
                StoredPositions::default()
            } else {
                self.fetch()
            };
            self.loaded = Some(fetched);
        }
        self.loaded.get_or_insert_with(StoredPositions::default)
    }

    /// Read the client's state, waiting for a lagging stash to show the
    /// token's write index.
    fn fetch(&self) -> StoredPositions {
        let key = state_key(&self.client);
        let wanted = self.token.as_ref().map_or(0, |t| t.write_index);
        let deadline = deadline_after(self.config.stash_wait_timeout());

        loop {
            let mut state = match self.read_state(&key) {
                Ok(state) => state,
                Err(err) => {
                    Logger::emit(
                        Event::ChronologyLoadFailed,
                        &[("error", &err.to_string()), ("key", &key)],
                    );
                    return StoredPositions::default();
                }
            };

            let now = Instant::now();
            if state.write_index >= wanted || now >= deadline {
                if state.write_index < wanted {
                    let found = state.write_index.to_string();
                    let expected = wanted.to_string();
                    Logger::emit(
                        Event::ChronologyStashLagged,
                        &[("expected", &expected), ("found", &found), ("key", &key)],
                    );
                }
                state.prune(Utc::now(), self.config.position_ttl());
                let domains = state.positions.len().to_string();
                Logger::emit(
                    Event::ChronologyLoaded,
                    &[("domains", &domains), ("key", &key)],
                );
                return state;
            }
            thread::sleep(STASH_POLL.min(deadline - now));
        }
    }

    fn read_state(&self, key: &str) -> StashResult<StoredPositions> {
        match self.stash.get(key)? {
            Some(bytes) => {
                StoredPositions::decode(&bytes).map_err(|e| StashError::corrupt(key, e))
            }
            None => Ok(StoredPositions::default()),
        }
    }

    // =========================================================================
    // REQUEST END
    // =========================================================================

    /// Note the primary position of every load balancer that has or made
    /// writes. Returns how many domains were recorded.
    pub fn record_positions<'a, I>(&mut self, balancers: I) -> usize
    where
        I: IntoIterator<Item = &'a LoadBalancer>,
    {
        let mut count = 0;
        for lb in balancers {
            if !lb.has_or_made_recent_writes() {
                continue;
            }
            let position = match lb.primary_position() {
                Ok(position) => Some(position),
                Err(err) => {
                    Logger::emit(
                        Event::ReplicaPositionUnavailable,
                        &[("domain", lb.domain().as_str()), ("error", &err.to_string())],
                    );
                    None
                }
            };
            self.recorded.insert(lb.domain().clone(), position);
            count += 1;
        }
        count
    }

    pub fn recorded_positions(&self) -> &BTreeMap<DomainId, Option<ReplicationPosition>> {
        &self.recorded
    }

    /// Fold recorded positions into the stash.
    ///
    /// On failure the caller must wait for replicas itself before answering
    /// the client.
    pub fn persist(&mut self) -> StashResult<PersistOutcome> {
        if !self.enabled || self.recorded.is_empty() {
            return Ok(PersistOutcome::Skipped);
        }

        let key = state_key(&self.client);
        match self.write_state(&key) {
            Ok(write_index) => {
                self.metrics.increment_chronology_persisted();
                let index = write_index.to_string();
                Logger::emit(
                    Event::ChronologyPersisted,
                    &[("key", &key), ("write_index", &index)],
                );
                Ok(PersistOutcome::Saved { write_index })
            }
            Err(err) => {
                self.metrics.increment_chronology_persist_failures();
                Logger::emit(
                    Event::ChronologyPersistFailed,
                    &[("error", &err.to_string()), ("key", &key)],
                );
                Err(err)
            }
        }
    }

    fn write_state(&self, key: &str) -> StashResult<u64> {
        let now = Utc::now();
        let ttl = self.config.position_ttl();

        // A corrupt entry is replaced rather than blocking every later write.
        let mut state = match self.read_state(key) {
            Err(StashError::Corrupt { .. }) => StoredPositions::default(),
            other => other?,
        };
        state.prune(now, ttl);
        state.merge(&self.recorded, now);
        state.write_index += 1;

        let bytes = state.encode().map_err(|e| StashError::corrupt(key, e))?;
        self.stash.set(key, &bytes, ttl)?;
        Ok(state.write_index)
    }

    /// Token to hand back to the client for a persisted write index
    pub fn issue_token(&self, write_index: u64) -> ClientToken {
        ClientToken::new(write_index, Utc::now(), self.client.clone())
    }
}
