//! # MoE Router
//!
//! Mixture-of-experts agent selection. Given a stage's required capability
//! set, filters the registered pool to eligible supersets and scores the
//! remainder by `(capability match specificity, -current_load,
//! recent_success_rate)`, tie-breaking by registration order so selection is
//! deterministic.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::agents::{AgentDescriptor, CapabilityTag};

#[derive(Default)]
struct RouterInner {
    next_seq: u64,
    agents: HashMap<String, AgentDescriptor>,
}

/// Registry and selector over the heterogeneous agent pool
#[derive(Default)]
pub struct MoeRouter {
    inner: RwLock<RouterInner>,
}

impl MoeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent (or replace its descriptor, keeping its seat in the
    /// registration order if it was already known)
    pub fn register(&self, mut descriptor: AgentDescriptor) {
        let mut inner = self.write();
        descriptor.registered_seq = match inner.agents.get(&descriptor.agent_id) {
            Some(existing) => existing.registered_seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };
        inner.agents.insert(descriptor.agent_id.clone(), descriptor);
    }

    /// Remove an agent from the pool
    pub fn deregister(&self, agent_id: &str) {
        self.write().agents.remove(agent_id);
    }

    /// Adjust an agent's current load by `delta` (floored at zero)
    pub fn adjust_load(&self, agent_id: &str, delta: i32) {
        if let Some(agent) = self.write().agents.get_mut(agent_id) {
            agent.current_load = agent.current_load.saturating_add_signed(delta);
        }
    }

    /// Record a stage outcome for success-rate scoring
    pub fn record_outcome(&self, agent_id: &str, success: bool) {
        if let Some(agent) = self.write().agents.get_mut(agent_id) {
            if success {
                agent.successes += 1;
            } else {
                agent.failures += 1;
            }
        }
    }

    /// Snapshot of one descriptor
    pub fn descriptor(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.read().agents.get(agent_id).cloned()
    }

    /// Number of registered agents
    pub fn agent_count(&self) -> usize {
        self.read().agents.len()
    }

    /// Select the best agent for a stage, or `None` when no candidate
    /// qualifies (the caller decides whether to wait, retry, or escalate).
    pub fn select_agent(
        &self,
        stage_name: &str,
        required: &BTreeSet<CapabilityTag>,
        tier: &str,
        excluded: &BTreeSet<String>,
    ) -> Option<AgentDescriptor> {
        let inner = self.read();
        let mut candidates: Vec<&AgentDescriptor> = inner
            .agents
            .values()
            .filter(|a| !excluded.contains(&a.agent_id))
            .filter(|a| a.eligible_for_tier(tier))
            .filter(|a| a.can_serve(required))
            .collect();

        candidates.sort_by(|a, b| {
            specificity(b, required)
                .partial_cmp(&specificity(a, required))
                .unwrap_or(Ordering::Equal)
                .then(a.current_load.cmp(&b.current_load))
                .then(
                    b.success_rate()
                        .partial_cmp(&a.success_rate())
                        .unwrap_or(Ordering::Equal),
                )
                .then(a.registered_seq.cmp(&b.registered_seq))
        });

        let selected = candidates.first().map(|a| (*a).clone());
        match &selected {
            Some(agent) => {
                tracing::debug!(stage = stage_name, agent_id = %agent.agent_id, "agent selected")
            }
            None => tracing::debug!(stage = stage_name, tier, "no agent available"),
        }
        selected
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RouterInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RouterInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// How specialized the agent is for this requirement: the share of its
/// capability set the requirement covers. A narrowly focused agent beats a
/// generalist that happens to qualify.
fn specificity(agent: &AgentDescriptor, required: &BTreeSet<CapabilityTag>) -> f64 {
    if agent.capabilities.is_empty() {
        return 0.0;
    }
    required.len() as f64 / agent.capabilities.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> BTreeSet<CapabilityTag> {
        tags.iter().map(|t| CapabilityTag::from(*t)).collect()
    }

    fn router_with(agents: Vec<AgentDescriptor>) -> MoeRouter {
        let router = MoeRouter::new();
        for agent in agents {
            router.register(agent);
        }
        router
    }

    #[test]
    fn test_requires_capability_superset() {
        let router = router_with(vec![
            AgentDescriptor::new("narrow").with_capabilities(["validate"]),
        ]);
        assert!(router
            .select_agent("s", &caps(&["validate", "test"]), "free", &BTreeSet::new())
            .is_none());
        assert!(router
            .select_agent("s", &caps(&["validate"]), "free", &BTreeSet::new())
            .is_some());
    }

    #[test]
    fn test_specialist_beats_generalist() {
        let router = router_with(vec![
            AgentDescriptor::new("generalist")
                .with_capabilities(["validate", "test", "review", "deploy"]),
            AgentDescriptor::new("specialist").with_capabilities(["validate"]),
        ]);
        let picked = router
            .select_agent("s", &caps(&["validate"]), "free", &BTreeSet::new())
            .expect("candidate");
        assert_eq!(picked.agent_id, "specialist");
    }

    #[test]
    fn test_lower_load_wins_among_equals() {
        let router = router_with(vec![
            AgentDescriptor::new("busy").with_capabilities(["test"]),
            AgentDescriptor::new("idle").with_capabilities(["test"]),
        ]);
        router.adjust_load("busy", 3);
        let picked = router
            .select_agent("s", &caps(&["test"]), "free", &BTreeSet::new())
            .expect("candidate");
        assert_eq!(picked.agent_id, "idle");
    }

    #[test]
    fn test_tie_break_by_registration_order() {
        let router = router_with(vec![
            AgentDescriptor::new("first").with_capabilities(["test"]),
            AgentDescriptor::new("second").with_capabilities(["test"]),
        ]);
        let picked = router
            .select_agent("s", &caps(&["test"]), "free", &BTreeSet::new())
            .expect("candidate");
        assert_eq!(picked.agent_id, "first");
    }

    #[test]
    fn test_excluded_and_tier_filters() {
        let router = router_with(vec![
            AgentDescriptor::new("a").with_capabilities(["test"]),
            AgentDescriptor::new("b")
                .with_capabilities(["test"])
                .with_tiers(["premium"]),
        ]);
        let excluded: BTreeSet<String> = ["a".to_string()].into();
        assert!(router
            .select_agent("s", &caps(&["test"]), "free", &excluded)
            .is_none());
        assert!(router
            .select_agent("s", &caps(&["test"]), "premium", &excluded)
            .is_some());
    }

    #[test]
    fn test_success_rate_breaks_load_ties() {
        let router = router_with(vec![
            AgentDescriptor::new("flaky").with_capabilities(["test"]),
            AgentDescriptor::new("solid").with_capabilities(["test"]),
        ]);
        router.record_outcome("flaky", false);
        router.record_outcome("solid", true);
        let picked = router
            .select_agent("s", &caps(&["test"]), "free", &BTreeSet::new())
            .expect("candidate");
        assert_eq!(picked.agent_id, "solid");
    }
}
