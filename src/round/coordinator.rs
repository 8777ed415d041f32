//! Round Coordinator
//!
//! Owns the load balancers of one logical unit of work and drives them
//! through the round phases as a global barrier sequence: no load balancer
//! commits before every load balancer has passed approval.
//!
//! Failure handling per phase:
//! - finalize: repeatable; failure aborts the round
//! - approve: single side-effect-free gate; failure aborts the round
//! - commit: the durable point; failures are reported, never undone
//! - post-commit callbacks: every callback runs, the first error is
//!   raised after the round is back to Idle

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::errors::{RoundError, RoundResult};
use super::stage::RoundStage;
use super::ticket::{OwnershipTicket, ReplicationWaitOptions, TicketedCommit};
use crate::balancer::{BalancerSettings, CallbackError, CommitOptions, LoadBalancer};
use crate::chronology::ChronologyTracker;
use crate::config::{ConfigError, CoordinatorConfig};
use crate::connection::ConnectionProvider;
use crate::domain::{DomainAliases, DomainId};
use crate::observability::{Event, Logger, MetricsRegistry, ObservationScope};

/// Coordinates commit and rollback across every load balancer of a request.
///
/// One instance models exactly one in-flight unit of work and is not shared
/// between concurrent requests.
pub struct RoundCoordinator {
    id: Uuid,
    provider: Arc<dyn ConnectionProvider>,
    aliases: DomainAliases,
    settings: BalancerSettings,
    commit_options: CommitOptions,
    max_finalize_sweeps: usize,
    replication_timeout: Duration,

    balancers: BTreeMap<DomainId, LoadBalancer>,
    stage: RoundStage,
    round: Option<String>,

    chronology: Option<ChronologyTracker>,
    metrics: Arc<MetricsRegistry>,
}

impl RoundCoordinator {
    /// Build a coordinator from validated configuration.
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        config: &CoordinatorConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let aliases = config.aliases()?;

        Ok(Self {
            id: Uuid::new_v4(),
            provider,
            aliases,
            settings: config.balancer_settings(),
            commit_options: config.commit_options(),
            max_finalize_sweeps: config.max_finalize_sweeps,
            replication_timeout: config.replication_wait_timeout(),
            balancers: BTreeMap::new(),
            stage: RoundStage::Idle,
            round: None,
            chronology: None,
            metrics,
        })
    }

    /// Instance identifier carried by issued tickets
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stage(&self) -> RoundStage {
        self.stage
    }

    /// Name of the open round, if any
    pub fn round_name(&self) -> Option<&str> {
        self.round.as_deref()
    }

    /// Commit options used when the caller supplies none
    pub fn commit_options(&self) -> &CommitOptions {
        &self.commit_options
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    // =========================================================================
    // LOAD BALANCERS
    // =========================================================================

    /// Load balancer for `domain`, created on first use.
    ///
    /// Aliases resolve to their canonical domain. A load balancer created
    /// while a round is open joins that round, and the attached chronology
    /// tracker is applied to it once.
    pub fn load_balancer(&mut self, domain: impl Into<DomainId>) -> RoundResult<&mut LoadBalancer> {
        let canonical = self.aliases.resolve(&domain.into());

        match self.balancers.entry(canonical) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut lb = LoadBalancer::connect(
                    entry.key().clone(),
                    self.provider.as_ref(),
                    &self.settings,
                    Arc::clone(&self.metrics),
                )?;
                if let Some(round) = &self.round {
                    lb.begin_changes(round)?;
                }
                if let Some(tracker) = self.chronology.as_mut() {
                    tracker.apply_on_startup(&mut lb);
                }
                Ok(entry.insert(lb))
            }
        }
    }

    /// Existing load balancer for `domain`, without creating one
    pub fn existing_balancer(&self, domain: impl Into<DomainId>) -> Option<&LoadBalancer> {
        self.balancers.get(&self.aliases.resolve(&domain.into()))
    }

    pub fn balancers(&self) -> impl Iterator<Item = &LoadBalancer> {
        self.balancers.values()
    }

    /// Attach chronology protection. Applies to existing load balancers now
    /// and to every load balancer created later.
    pub fn attach_chronology(&mut self, mut tracker: ChronologyTracker) {
        for lb in self.balancers.values_mut() {
            tracker.apply_on_startup(lb);
        }
        self.chronology = Some(tracker);
    }

    pub fn chronology(&self) -> Option<&ChronologyTracker> {
        self.chronology.as_ref()
    }

    pub fn take_chronology(&mut self) -> Option<ChronologyTracker> {
        self.chronology.take()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.balancers.values().any(LoadBalancer::has_pending_writes)
    }

    fn advance(&mut self, step: fn(RoundStage) -> RoundResult<RoundStage>) -> RoundResult<()> {
        self.stage = step(self.stage)?;
        Ok(())
    }

    // =========================================================================
    // ROUND PHASES
    // =========================================================================

    /// Open a round named `name` on every load balancer.
    pub fn begin_round(&mut self, name: &str) -> RoundResult<()> {
        if let Some(active) = &self.round {
            return Err(RoundError::round_conflict(format!(
                "cannot begin round '{}': round '{}' is still open",
                name, active
            )));
        }
        if let Some(bound) = self
            .balancers
            .values()
            .find_map(|lb| lb.round_id().filter(|r| *r != name))
        {
            return Err(RoundError::round_conflict(format!(
                "cannot begin round '{}': a load balancer is still bound to '{}'",
                name, bound
            )));
        }

        self.advance(RoundStage::begin)?;
        for lb in self.balancers.values_mut() {
            lb.begin_changes(name)?;
        }
        self.round = Some(name.to_string());
        self.advance(RoundStage::settle)?;

        self.metrics.increment_rounds_begun();
        Logger::emit(Event::RoundBegin, &[("round", name)]);
        Ok(())
    }

    /// Commit the round named `name` on every load balancer.
    pub fn commit_round(&mut self, name: &str, options: &CommitOptions) -> RoundResult<()> {
        if !self.stage.is_idle() {
            return Err(RoundError::round_mismatch(format!(
                "cannot commit round '{}' during {}",
                name,
                self.stage.name()
            )));
        }
        if let Some(active) = &self.round {
            if active != name {
                return Err(RoundError::round_mismatch(format!(
                    "round '{}' is owned by '{}'",
                    name, active
                )));
            }
        }

        let scope = ObservationScope::with_fields("ROUND_COMMIT", &[("round", name)]);
        self.advance(RoundStage::start_commit)?;

        if let Err(err) = self.finalize_all(name) {
            Logger::emit(
                Event::RoundPreCommitFailed,
                &[("error", &err.message), ("round", name)],
            );
            self.abort_round(name)?;
            scope.fail(&err.message);
            return Err(err);
        }

        self.round = None;

        if let Err(err) = self.approve_all(name, options) {
            self.metrics.increment_approval_failures();
            Logger::emit(
                Event::RoundApprovalFailed,
                &[("error", &err.message), ("round", name)],
            );
            self.abort_round(name)?;
            scope.fail(&err.message);
            return Err(err);
        }

        let commit_error = self.commit_all(name);

        self.advance(RoundStage::committed)?;
        let callback_error = self.run_post_callbacks(name);
        self.advance(RoundStage::settle)?;

        if let Some(err) = commit_error {
            scope.fail(&err.message);
            return Err(err);
        }
        self.metrics.increment_rounds_committed();
        scope.complete();

        match callback_error {
            Some(err) => Err(RoundError::post_commit_callback(&err)),
            None => Ok(()),
        }
    }

    /// Roll back the open round.
    ///
    /// Any caller may cancel the round; a caller other than the owner is
    /// logged. Once writes are durable this is a logged no-op.
    pub fn rollback_round(&mut self, name: &str) -> RoundResult<()> {
        if self.stage.is_post_callbacks() {
            Logger::emit(
                Event::RoundRollbackIgnored,
                &[("round", name), ("stage", self.stage.name())],
            );
            return Ok(());
        }
        if !self.stage.is_idle() {
            return Err(RoundError::round_mismatch(format!(
                "cannot roll back round '{}' during {}",
                name,
                self.stage.name()
            )));
        }

        let owner = self.round.clone().unwrap_or_else(|| name.to_string());
        if owner != name {
            Logger::emit(
                Event::RoundRollbackOnBehalf,
                &[("caller", name), ("owner", &owner)],
            );
        }

        let scope = ObservationScope::with_fields("ROUND_ROLLBACK", &[("round", &owner)]);
        self.round = None;
        self.advance(RoundStage::start_rollback)?;
        let callback_error = self.rollback_all(&owner);
        self.advance(RoundStage::settle)?;
        scope.complete();

        match callback_error {
            Some(err) => Err(RoundError::post_commit_callback(&err)),
            None => Ok(()),
        }
    }

    /// Sweep pre-commit work until a full sweep executes nothing.
    fn finalize_all(&mut self, round: &str) -> RoundResult<()> {
        for _ in 0..self.max_finalize_sweeps {
            let mut executed = 0;
            for lb in self.balancers.values_mut() {
                executed += lb.finalize_changes(round)?;
            }
            if executed == 0 {
                return Ok(());
            }
        }
        Err(RoundError::pre_commit_failure(format!(
            "pre-commit work for round '{}' still pending after {} sweeps",
            round, self.max_finalize_sweeps
        )))
    }

    fn approve_all(&self, round: &str, options: &CommitOptions) -> RoundResult<()> {
        for lb in self.balancers.values() {
            lb.approve_changes(options, round)?;
        }
        Ok(())
    }

    fn commit_all(&mut self, round: &str) -> Option<RoundError> {
        let mut first_error = None;
        for lb in self.balancers.values_mut() {
            if let Err(err) = lb.commit_changes(round) {
                self.metrics.increment_commit_failures();
                Logger::emit(
                    Event::RoundCommitFailed,
                    &[
                        ("domain", lb.domain().as_str()),
                        ("error", &err.message),
                        ("round", round),
                    ],
                );
                first_error.get_or_insert(err);
            }
        }
        first_error
    }

    fn run_post_callbacks(&mut self, round: &str) -> Option<CallbackError> {
        let mut first_error = None;
        for lb in self.balancers.values_mut() {
            if let Err(err) = lb.run_idle_callbacks(round) {
                first_error.get_or_insert(err);
            }
        }
        for lb in self.balancers.values_mut() {
            if let Err(err) = lb.run_listener_callbacks(round) {
                first_error.get_or_insert(err);
            }
        }
        first_error
    }

    /// RollingBack → PostRollbackCallbacks, returning the first callback error.
    /// Leaves the stage at PostRollbackCallbacks.
    fn rollback_all(&mut self, round: &str) -> Option<CallbackError> {
        for lb in self.balancers.values_mut() {
            lb.rollback_changes(round);
        }
        self.metrics.increment_rounds_rolled_back();
        if let Err(err) = self.advance(RoundStage::rolled_back) {
            return Some(CallbackError::new("round", err.message));
        }
        self.run_post_callbacks(round)
    }

    /// Roll back a round whose commit was refused before the durable point.
    /// Callback errors are logged by the load balancers and not raised.
    fn abort_round(&mut self, round: &str) -> RoundResult<()> {
        self.round = None;
        self.advance(RoundStage::start_rollback)?;
        let _ = self.rollback_all(round);
        self.advance(RoundStage::settle)
    }

    // =========================================================================
    // OWNERSHIP TICKETS
    // =========================================================================

    /// Issue a ticket for this instance, only when nothing is pending.
    pub fn issue_empty_ticket(&self) -> Option<OwnershipTicket> {
        if self.has_pending_writes() {
            let round = self.round.as_deref().unwrap_or("");
            Logger::emit(Event::RoundTicketUnavailable, &[("round", round)]);
            return None;
        }
        Some(OwnershipTicket::new(self.id))
    }

    /// Commit, possibly on behalf of the open round's owner, then wait for
    /// replicas.
    ///
    /// When `name` is not the open round, the open round is committed under
    /// its owner's name and reopened empty afterwards, so the owner's own
    /// commit later still succeeds.
    pub fn commit_and_wait_for_replication(
        &mut self,
        name: &str,
        ticket: OwnershipTicket,
        options: &ReplicationWaitOptions,
    ) -> RoundResult<TicketedCommit> {
        if ticket.owner() != self.id {
            let owner = ticket.owner().to_string();
            let expected = self.id.to_string();
            self.metrics.increment_tickets_rejected();
            Logger::emit(
                Event::RoundTicketRejected,
                &[("caller", name), ("expected", &expected), ("ticket", &owner)],
            );
            return Ok(TicketedCommit::Rejected);
        }

        let owner = self.round.clone().unwrap_or_else(|| name.to_string());
        let delegated = owner != name;
        if delegated {
            self.metrics.increment_delegated_commits();
            Logger::emit(
                Event::RoundDelegatedCommit,
                &[("caller", name), ("owner", &owner)],
            );
        }

        let commit_options = self.commit_options.clone();
        self.commit_round(&owner, &commit_options)?;
        let replicas_caught_up = self.wait_for_replication(options);
        if delegated {
            self.begin_round(&owner)?;
        }

        Ok(TicketedCommit::Committed {
            replicas_caught_up,
            delegated,
        })
    }

    // =========================================================================
    // REPLICATION
    // =========================================================================

    /// Wait until replicas of every load balancer that has or made writes
    /// reach their primary's current position.
    pub fn wait_for_replication(&mut self, options: &ReplicationWaitOptions) -> bool {
        let timeout = options.timeout.unwrap_or(self.replication_timeout);
        let only = options.domain.as_ref().map(|d| self.aliases.resolve(d));

        let mut caught_up = true;
        for (domain, lb) in self.balancers.iter_mut() {
            if only.as_ref().is_some_and(|d| d != domain) {
                continue;
            }
            if !lb.has_or_made_recent_writes() {
                continue;
            }
            match lb.primary_position() {
                Ok(position) => caught_up &= lb.wait_for_all(position, timeout),
                Err(err) => {
                    Logger::emit(
                        Event::ReplicaPositionUnavailable,
                        &[("domain", domain.as_str()), ("error", &err.to_string())],
                    );
                    caught_up = false;
                }
            }
        }
        caught_up
    }
}
