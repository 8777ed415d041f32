//! Coordinator configuration
//!
//! Fixed at request start. Every field has a default, so an empty JSON
//! object is a valid configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::balancer::{BalancerSettings, CommitOptions};
use crate::domain::{DomainAliases, DomainError};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The document could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The alias table is malformed
    #[error("invalid domain alias table: {0}")]
    Domain(#[from] DomainError),
}

/// Kind of request being served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Web request with a waiting user; short waits
    #[default]
    Interactive,
    /// CLI or background job; long waits, no chronology protection
    Batch,
}

/// What chronology protection does for a domain the client wrote to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStrategy {
    /// Wait for replicas to reach the recorded position
    #[default]
    WaitForReplicas,
    /// Send reads to the primary
    PinToPrimary,
}

/// Chronology protection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChronologyConfig {
    /// Enable chronology protection (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Client tokens older than this are discarded (default: 10)
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Stored positions expire after this (default: 60)
    #[serde(default = "default_position_ttl_secs")]
    pub position_ttl_secs: u64,

    /// How long to wait for a lagging stash to show the client's latest
    /// write index (default: 500)
    #[serde(default = "default_stash_wait_timeout_ms")]
    pub stash_wait_timeout_ms: u64,

    #[serde(default)]
    pub read_strategy: ReadStrategy,
}

fn default_enabled() -> bool {
    true
}

fn default_token_ttl_secs() -> u64 {
    10
}

fn default_position_ttl_secs() -> u64 {
    60
}

fn default_stash_wait_timeout_ms() -> u64 {
    500
}

impl Default for ChronologyConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            token_ttl_secs: default_token_ttl_secs(),
            position_ttl_secs: default_position_ttl_secs(),
            stash_wait_timeout_ms: default_stash_wait_timeout_ms(),
            read_strategy: ReadStrategy::default(),
        }
    }
}

impl ChronologyConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn position_ttl(&self) -> Duration {
        Duration::from_secs(self.position_ttl_secs)
    }

    pub fn stash_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.stash_wait_timeout_ms)
    }
}

/// Round coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub context: ContextKind,

    /// Replica wait timeout; defaults to 1s interactive, 60s batch
    #[serde(default)]
    pub replication_wait_timeout_ms: Option<u64>,

    /// Sleep between replica position polls (default: 10)
    #[serde(default = "default_replica_poll_interval_ms")]
    pub replica_poll_interval_ms: u64,

    /// Finalize sweeps allowed before a commit is aborted (default: 100).
    ///
    /// A safety valve against pre-commit work that keeps enqueueing itself
    /// forever. Every unit of work runs once, so any finite cascade settles;
    /// raise this for cascades deeper than the default allows.
    #[serde(default = "default_max_finalize_sweeps")]
    pub max_finalize_sweeps: usize,

    /// Default approval limit on time spent in writes
    #[serde(default)]
    pub max_write_duration_ms: Option<u64>,

    /// alias → canonical domain
    #[serde(default)]
    pub domain_aliases: BTreeMap<String, String>,

    #[serde(default)]
    pub chronology: ChronologyConfig,
}

fn default_replica_poll_interval_ms() -> u64 {
    10
}

fn default_max_finalize_sweeps() -> usize {
    100
}

/// Longest accepted lifetime of stored write positions (one week)
pub const MAX_POSITION_TTL_SECS: u64 = 7 * 24 * 3600;

const INTERACTIVE_WAIT: Duration = Duration::from_secs(1);
const BATCH_WAIT: Duration = Duration::from_secs(60);

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            context: ContextKind::default(),
            replication_wait_timeout_ms: None,
            replica_poll_interval_ms: default_replica_poll_interval_ms(),
            max_finalize_sweeps: default_max_finalize_sweeps(),
            max_write_duration_ms: None,
            domain_aliases: BTreeMap::new(),
            chronology: ChronologyConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults for a CLI or background job
    pub fn batch() -> Self {
        Self {
            context: ContextKind::Batch,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replica_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "replica_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_finalize_sweeps == 0 {
            return Err(ConfigError::Invalid(
                "max_finalize_sweeps must be positive".to_string(),
            ));
        }
        if self.chronology.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "chronology.token_ttl_secs must be positive".to_string(),
            ));
        }
        if self.chronology.position_ttl_secs > MAX_POSITION_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "chronology.position_ttl_secs must be at most {}",
                MAX_POSITION_TTL_SECS
            )));
        }
        DomainAliases::new(&self.domain_aliases)?;
        Ok(())
    }

    pub fn aliases(&self) -> Result<DomainAliases, ConfigError> {
        Ok(DomainAliases::new(&self.domain_aliases)?)
    }

    /// Bound on every replica wait
    pub fn replication_wait_timeout(&self) -> Duration {
        match (self.replication_wait_timeout_ms, self.context) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, ContextKind::Interactive) => INTERACTIVE_WAIT,
            (None, ContextKind::Batch) => BATCH_WAIT,
        }
    }

    pub fn replica_poll_interval(&self) -> Duration {
        Duration::from_millis(self.replica_poll_interval_ms)
    }

    pub fn balancer_settings(&self) -> BalancerSettings {
        BalancerSettings {
            replica_poll_interval: self.replica_poll_interval(),
        }
    }

    pub fn commit_options(&self) -> CommitOptions {
        CommitOptions {
            max_write_duration: self.max_write_duration_ms.map(Duration::from_millis),
        }
    }

    /// Chronology protection applies to interactive requests only.
    pub fn chronology_active(&self) -> bool {
        self.chronology.enabled && self.context == ContextKind::Interactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.context, ContextKind::Interactive);
        assert_eq!(config.max_finalize_sweeps, 100);
        assert_eq!(config.replication_wait_timeout(), Duration::from_secs(1));
        assert_eq!(config.chronology.token_ttl(), Duration::from_secs(10));
        assert_eq!(config.chronology.position_ttl(), Duration::from_secs(60));
        assert!(config.chronology_active());
    }

    #[test]
    fn test_batch_waits_longer_without_chronology() {
        let config = CoordinatorConfig::batch();
        assert_eq!(config.replication_wait_timeout(), Duration::from_secs(60));
        assert!(!config.chronology_active());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = CoordinatorConfig::from_json("{}").unwrap();
        assert_eq!(config, CoordinatorConfig::default());
    }

    #[test]
    fn test_from_json() {
        let config = CoordinatorConfig::from_json(
            r#"{
                "context": "batch",
                "replication_wait_timeout_ms": 250,
                "max_write_duration_ms": 3000,
                "domain_aliases": {"wiki": "main"},
                "chronology": {"read_strategy": "pin_to_primary"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.context, ContextKind::Batch);
        assert_eq!(config.replication_wait_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.commit_options().max_write_duration,
            Some(Duration::from_secs(3))
        );
        assert_eq!(config.chronology.read_strategy, ReadStrategy::PinToPrimary);
        assert!(config.chronology.enabled);
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let err = CoordinatorConfig::from_json(r#"{"replica_poll_interval_ms": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_oversized_position_ttl() {
        let mut config = CoordinatorConfig::default();
        config.chronology.position_ttl_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.chronology.position_ttl_secs = MAX_POSITION_TTL_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_chained_aliases() {
        let err = CoordinatorConfig::from_json(r#"{"domain_aliases": {"a": "b", "b": "c"}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Domain(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = CoordinatorConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
