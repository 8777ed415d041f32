//! Cluster domain identifiers and the alias table
//!
//! A domain names one logical database (one primary plus its replicas).
//! Aliases are resolved to their canonical domain once, when the table is
//! built at startup; afterwards each lookup is one map read.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque name of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(String);

impl DomainId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DomainId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Alias table errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// Empty alias or target name
    #[error("domain names must not be empty")]
    EmptyName,

    /// An alias points at another alias
    #[error("alias '{alias}' targets '{target}', which is itself an alias")]
    ChainedAlias { alias: String, target: String },

    /// An alias points at itself
    #[error("alias '{0}' targets itself")]
    SelfAlias(String),
}

/// Static alias → canonical domain mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainAliases {
    aliases: BTreeMap<DomainId, DomainId>,
}

impl DomainAliases {
    /// Build the table, rejecting anything that would not resolve in one step.
    pub fn new(aliases: &BTreeMap<String, String>) -> Result<Self, DomainError> {
        let mut table = BTreeMap::new();
        for (alias, target) in aliases {
            if alias.is_empty() || target.is_empty() {
                return Err(DomainError::EmptyName);
            }
            if alias == target {
                return Err(DomainError::SelfAlias(alias.clone()));
            }
            if aliases.contains_key(target) {
                return Err(DomainError::ChainedAlias {
                    alias: alias.clone(),
                    target: target.clone(),
                });
            }
            table.insert(DomainId::new(alias.as_str()), DomainId::new(target.as_str()));
        }
        Ok(Self { aliases: table })
    }

    /// Canonical form of `domain`.
    pub fn resolve(&self, domain: &DomainId) -> DomainId {
        self.aliases.get(domain).unwrap_or(domain).clone()
    }

    pub fn is_alias(&self, domain: &DomainId) -> bool {
        self.aliases.contains_key(domain)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}
