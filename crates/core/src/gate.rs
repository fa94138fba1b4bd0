//! # Feature Gate
//!
//! Tier-based admission control over concurrent agent slots and allowed
//! capabilities/backends. The per-tier counters are the only globally shared
//! mutable state in the core; they are mutated exclusively through atomic
//! compare-and-increment so the admission bound holds under any number of
//! concurrent callers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::agents::CapabilityTag;

/// Read-only policy for one tier, shared by all sessions of that tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    pub tier_name: String,
    pub max_concurrent_agents: u32,
    /// Capabilities sessions of this tier may request (empty means all)
    #[serde(default)]
    pub allowed_capabilities: BTreeSet<CapabilityTag>,
    /// Execution backends sessions of this tier may use (empty means all)
    #[serde(default)]
    pub allowed_backends: BTreeSet<String>,
}

impl TierPolicy {
    pub fn new(tier_name: impl Into<String>, max_concurrent_agents: u32) -> Self {
        Self {
            tier_name: tier_name.into(),
            max_concurrent_agents,
            allowed_capabilities: BTreeSet::new(),
            allowed_backends: BTreeSet::new(),
        }
    }

    fn allows_capability(&self, cap: &CapabilityTag) -> bool {
        self.allowed_capabilities.is_empty() || self.allowed_capabilities.contains(cap)
    }

    fn allows_backend(&self, backend: &str) -> bool {
        self.allowed_backends.is_empty() || self.allowed_backends.contains(backend)
    }
}

/// Why admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    AgentLimitExceeded,
    CapabilityNotAllowed,
    BackendNotAllowed,
    UnknownTier,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentLimitExceeded => "AGENT_LIMIT_EXCEEDED",
            Self::CapabilityNotAllowed => "CAPABILITY_NOT_ALLOWED",
            Self::BackendNotAllowed => "BACKEND_NOT_ALLOWED",
            Self::UnknownTier => "UNKNOWN_TIER",
        };
        f.write_str(s)
    }
}

/// Outcome of an admission check. Denial is a normal value, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied(DenialReason),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

struct TierSlots {
    policy: TierPolicy,
    in_flight: AtomicU32,
}

/// Admission control over the configured tiers
pub struct FeatureGate {
    tiers: HashMap<String, TierSlots>,
}

impl FeatureGate {
    pub fn new(policies: Vec<TierPolicy>) -> Self {
        let tiers = policies
            .into_iter()
            .map(|policy| {
                (
                    policy.tier_name.clone(),
                    TierSlots {
                        policy,
                        in_flight: AtomicU32::new(0),
                    },
                )
            })
            .collect();
        Self { tiers }
    }

    /// Atomically check-and-increment an agent slot for `tier`.
    ///
    /// Capability and backend checks run first so a policy denial never
    /// consumes a slot. The counter itself is claimed with a single
    /// compare-and-increment, safe under concurrent callers.
    pub fn try_admit(
        &self,
        tier: &str,
        capabilities: &BTreeSet<CapabilityTag>,
        backend: &str,
    ) -> Admission {
        let Some(slots) = self.tiers.get(tier) else {
            tracing::warn!(tier, "admission check against unknown tier");
            return Admission::Denied(DenialReason::UnknownTier);
        };

        if let Some(cap) = capabilities.iter().find(|c| !slots.policy.allows_capability(c)) {
            tracing::debug!(tier, capability = %cap, "capability not allowed for tier");
            return Admission::Denied(DenialReason::CapabilityNotAllowed);
        }
        if !slots.policy.allows_backend(backend) {
            return Admission::Denied(DenialReason::BackendNotAllowed);
        }

        let claimed = slots.in_flight.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n < slots.policy.max_concurrent_agents {
                Some(n + 1)
            } else {
                None
            }
        });

        match claimed {
            Ok(_) => Admission::Granted,
            Err(_) => Admission::Denied(DenialReason::AgentLimitExceeded),
        }
    }

    /// Release a previously granted slot
    pub fn release(&self, tier: &str) {
        if let Some(slots) = self.tiers.get(tier) {
            let result = slots
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if result.is_err() {
                tracing::warn!(tier, "release without a matching admit");
            }
        }
    }

    /// Currently admitted slots for a tier (0 for unknown tiers)
    pub fn in_flight(&self, tier: &str) -> u32 {
        self.tiers
            .get(tier)
            .map(|slots| slots.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Look up the policy for a tier
    pub fn policy(&self, tier: &str) -> Option<&TierPolicy> {
        self.tiers.get(tier).map(|slots| &slots.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn caps(tags: &[&str]) -> BTreeSet<CapabilityTag> {
        tags.iter().map(|t| CapabilityTag::from(*t)).collect()
    }

    fn free_tier() -> TierPolicy {
        TierPolicy {
            tier_name: "free".to_string(),
            max_concurrent_agents: 4,
            allowed_capabilities: caps(&["validate", "test"]),
            allowed_backends: ["local".to_string()].into(),
        }
    }

    #[test]
    fn test_fifth_slot_denied() {
        let gate = FeatureGate::new(vec![free_tier()]);
        let want = caps(&["validate"]);
        for _ in 0..4 {
            assert!(gate.try_admit("free", &want, "local").is_granted());
        }
        assert_eq!(
            gate.try_admit("free", &want, "local"),
            Admission::Denied(DenialReason::AgentLimitExceeded)
        );
        gate.release("free");
        assert!(gate.try_admit("free", &want, "local").is_granted());
    }

    #[test]
    fn test_capability_and_backend_denials_consume_no_slot() {
        let gate = FeatureGate::new(vec![free_tier()]);
        assert_eq!(
            gate.try_admit("free", &caps(&["deploy"]), "local"),
            Admission::Denied(DenialReason::CapabilityNotAllowed)
        );
        assert_eq!(
            gate.try_admit("free", &caps(&["validate"]), "cloud"),
            Admission::Denied(DenialReason::BackendNotAllowed)
        );
        assert_eq!(gate.in_flight("free"), 0);
    }

    #[test]
    fn test_unknown_tier_denied() {
        let gate = FeatureGate::new(vec![free_tier()]);
        assert_eq!(
            gate.try_admit("platinum", &caps(&["validate"]), "local"),
            Admission::Denied(DenialReason::UnknownTier)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_admission_bound_under_concurrency() {
        let gate = Arc::new(FeatureGate::new(vec![free_tier()]));
        let want = caps(&["validate"]);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let gate = Arc::clone(&gate);
            let want = want.clone();
            handles.push(tokio::spawn(async move {
                gate.try_admit("free", &want, "local").is_granted()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                granted += 1;
            }
        }
        assert_eq!(granted, 4);
        assert_eq!(gate.in_flight("free"), 4);
    }
}
