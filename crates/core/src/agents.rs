//! # Agent Descriptors
//!
//! Tagged records describing the agents available to the router. Capability
//! dispatch is explicit: an agent advertises a capability set and tier
//! eligibility, and selection works over those records only - no runtime
//! type inspection.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named capability an agent advertises (e.g. "code.review", "deploy")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityTag(pub String);

impl CapabilityTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Descriptor for a registered agent
///
/// Created on registration, updated on load change, removed on
/// deregistration. The router owns the authoritative copy; callers receive
/// clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent identifier
    pub agent_id: String,
    /// Capabilities this agent can serve
    pub capabilities: BTreeSet<CapabilityTag>,
    /// Number of task nodes currently assigned to this agent
    pub current_load: u32,
    /// Tiers this agent may serve (empty set means all tiers)
    pub tier_eligibility: BTreeSet<String>,
    /// Completed stage executions that passed their quality gate
    #[serde(default)]
    pub successes: u64,
    /// Failed or rejected stage executions
    #[serde(default)]
    pub failures: u64,
    /// Registration order, used as the deterministic tie-breaker
    #[serde(default)]
    pub registered_seq: u64,
}

impl AgentDescriptor {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: BTreeSet::new(),
            current_load: 0,
            tier_eligibility: BTreeSet::new(),
            successes: 0,
            failures: 0,
            registered_seq: 0,
        }
    }

    pub fn with_capabilities<I, T>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CapabilityTag>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tiers<I, T>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tier_eligibility = tiers.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this agent's capability set is a superset of `required`
    pub fn can_serve(&self, required: &BTreeSet<CapabilityTag>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Whether this agent may serve sessions of the given tier
    pub fn eligible_for_tier(&self, tier: &str) -> bool {
        self.tier_eligibility.is_empty() || self.tier_eligibility.contains(tier)
    }

    /// Fraction of recorded outcomes that succeeded (1.0 with no history)
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}
