//! Request Context
//!
//! Explicitly constructed at request start and passed by reference to
//! whatever needs the database; there is no process-wide instance.
//! `shutdown` flushes it at request end.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::chronology::{ChronologyTracker, ClientRequest, ClientToken, PersistOutcome};
use crate::config::{ConfigError, ContextKind, CoordinatorConfig};
use crate::connection::ConnectionProvider;
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::round::{ReplicationWaitOptions, RoundCoordinator};
use crate::stash::Stash;

/// What request shutdown did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Token to hand back to the client; set when positions were saved
    pub client_token: Option<ClientToken>,
    /// Write positions reached the stash
    pub positions_saved: bool,
    /// Replicas caught up, or no wait was needed
    pub replicas_caught_up: bool,
}

impl ShutdownReport {
    /// Wire form of the client token
    pub fn token_string(&self) -> Option<String> {
        self.client_token.as_ref().map(ToString::to_string)
    }
}

/// Everything one request needs to talk to the database clusters
pub struct RequestContext {
    /// Request ID for tracing
    pub request_id: Uuid,
    kind: ContextKind,
    coordinator: RoundCoordinator,
    metrics: Arc<MetricsRegistry>,
    started_at: Instant,
}

impl RequestContext {
    /// Start a request with a fresh metrics registry.
    pub fn start(
        config: &CoordinatorConfig,
        provider: Arc<dyn ConnectionProvider>,
        stash: Arc<dyn Stash>,
        request: &ClientRequest,
    ) -> Result<Self, ConfigError> {
        Self::start_with_metrics(
            config,
            provider,
            stash,
            request,
            Arc::new(MetricsRegistry::new()),
        )
    }

    /// Start a request reporting into a shared metrics registry.
    pub fn start_with_metrics(
        config: &CoordinatorConfig,
        provider: Arc<dyn ConnectionProvider>,
        stash: Arc<dyn Stash>,
        request: &ClientRequest,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, ConfigError> {
        let mut coordinator = RoundCoordinator::new(provider, config, Arc::clone(&metrics))?;
        let tracker = ChronologyTracker::new(request, stash, config, Arc::clone(&metrics));
        let chronology = if tracker.is_enabled() { "on" } else { "off" };

        let request_id = Uuid::new_v4();
        let id = request_id.to_string();
        Logger::emit(
            Event::ContextStart,
            &[
                ("chronology", chronology),
                ("client", tracker.client_id().as_str()),
                ("request_id", &id),
            ],
        );
        coordinator.attach_chronology(tracker);

        Ok(Self {
            request_id,
            kind: config.context,
            coordinator,
            metrics,
            started_at: Instant::now(),
        })
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn coordinator(&self) -> &RoundCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut RoundCoordinator {
        &mut self.coordinator
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    /// Flush the request.
    ///
    /// A round left open is rolled back. Write positions are persisted for
    /// the client's next request; if that fails, this waits for replicas
    /// instead so the client still sees its writes.
    pub fn shutdown(mut self) -> ShutdownReport {
        let id = self.request_id.to_string();
        let coordinator = &mut self.coordinator;

        if let Some(round) = coordinator.round_name().map(str::to_string) {
            Logger::emit(
                Event::ContextRoundAbandoned,
                &[("request_id", &id), ("round", &round)],
            );
            // Callback failures were already logged by the load balancers.
            let _ = coordinator.rollback_round(&round);
        }

        let mut report = ShutdownReport {
            client_token: None,
            positions_saved: false,
            replicas_caught_up: true,
        };

        if let Some(mut tracker) = coordinator.take_chronology() {
            tracker.record_positions(coordinator.balancers());
            match tracker.persist() {
                Ok(PersistOutcome::Saved { write_index }) => {
                    report.positions_saved = true;
                    report.client_token = Some(tracker.issue_token(write_index));
                }
                Ok(PersistOutcome::Skipped) => {}
                Err(_) => {
                    report.replicas_caught_up =
                        coordinator.wait_for_replication(&ReplicationWaitOptions::default());
                }
            }
        }

        let elapsed = self.started_at.elapsed().as_millis().to_string();
        let saved = report.positions_saved.to_string();
        let caught_up = report.replicas_caught_up.to_string();
        Logger::emit(
            Event::ContextShutdown,
            &[
                ("elapsed_ms", &elapsed),
                ("positions_saved", &saved),
                ("replicas_caught_up", &caught_up),
                ("request_id", &id),
            ],
        );
        report
    }
}
