//! Round stage machine
//!
//! - Stages are explicit and enumerable
//! - Transitions are driven by coordinator calls, never inferred
//! - Every stage other than `Idle` is transient within one coordinator call
//!
//! Allowed transitions:
//!
//! ```text
//! Idle ──> Beginning ──> Idle
//! Idle ──> Committing ──> PostCommitCallbacks ──> Idle
//!              │
//!              └──> RollingBack ──> PostRollbackCallbacks ──> Idle
//! Idle ──> RollingBack
//! ```

use super::errors::{RoundError, RoundResult};

/// Stage of the round coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundStage {
    /// No round phase in progress
    #[default]
    Idle,

    /// Load balancers are being bound to a new round
    Beginning,

    /// Pre-commit work, approval and commit are running
    Committing,

    /// Load balancers are rolling back
    RollingBack,

    /// Post-commit callbacks are running; writes are durable
    PostCommitCallbacks,

    /// Post-rollback callbacks are running
    PostRollbackCallbacks,
}

impl RoundStage {
    /// Stage name for observability
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Beginning => "Beginning",
            Self::Committing => "Committing",
            Self::RollingBack => "RollingBack",
            Self::PostCommitCallbacks => "PostCommitCallbacks",
            Self::PostRollbackCallbacks => "PostRollbackCallbacks",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// True while post-resolution callbacks run
    pub fn is_post_callbacks(&self) -> bool {
        matches!(
            self,
            Self::PostCommitCallbacks | Self::PostRollbackCallbacks
        )
    }

    // =========================================================================
    // ALLOWED TRANSITIONS
    // =========================================================================

    /// Idle → Beginning
    pub fn begin(self) -> RoundResult<Self> {
        match self {
            Self::Idle => Ok(Self::Beginning),
            _ => Err(RoundError::forbidden_transition(self.name(), "Beginning")),
        }
    }

    /// Idle → Committing
    pub fn start_commit(self) -> RoundResult<Self> {
        match self {
            Self::Idle => Ok(Self::Committing),
            _ => Err(RoundError::forbidden_transition(self.name(), "Committing")),
        }
    }

    /// Committing → PostCommitCallbacks
    ///
    /// Every primary has been asked to commit.
    pub fn committed(self) -> RoundResult<Self> {
        match self {
            Self::Committing => Ok(Self::PostCommitCallbacks),
            _ => Err(RoundError::forbidden_transition(
                self.name(),
                "PostCommitCallbacks",
            )),
        }
    }

    /// Idle → RollingBack, or Committing → RollingBack when a commit aborts
    pub fn start_rollback(self) -> RoundResult<Self> {
        match self {
            Self::Idle | Self::Committing => Ok(Self::RollingBack),
            _ => Err(RoundError::forbidden_transition(self.name(), "RollingBack")),
        }
    }

    /// RollingBack → PostRollbackCallbacks
    pub fn rolled_back(self) -> RoundResult<Self> {
        match self {
            Self::RollingBack => Ok(Self::PostRollbackCallbacks),
            _ => Err(RoundError::forbidden_transition(
                self.name(),
                "PostRollbackCallbacks",
            )),
        }
    }

    /// Beginning, PostCommitCallbacks or PostRollbackCallbacks → Idle
    pub fn settle(self) -> RoundResult<Self> {
        match self {
            Self::Beginning | Self::PostCommitCallbacks | Self::PostRollbackCallbacks => {
                Ok(Self::Idle)
            }
            _ => Err(RoundError::forbidden_transition(self.name(), "Idle")),
        }
    }
}
