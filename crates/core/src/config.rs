//! Orchestrator configuration. Defaults match the built-in tier policies
//! and the standard delivery pipeline; callers override fields or load the
//! whole struct from JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::CapabilityTag;
use crate::gate::TierPolicy;
use crate::mediator::HandoffConfig;
use crate::orchestrator::StageDescriptor;

/// How admission denials from the feature gate are retried. Only limit
/// denials are retried; policy denials escalate immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Backend identity checked against tier allow-lists
    pub backend_id: String,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub admission: AdmissionPolicy,
    /// Upper bound on a single stage execution
    pub execution_timeout_ms: u64,
    pub tiers: Vec<TierPolicy>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend_id: "local".to_string(),
            handoff: HandoffConfig::default(),
            admission: AdmissionPolicy::default(),
            execution_timeout_ms: 30_000,
            tiers: default_tiers(),
        }
    }
}

impl OrchestratorConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

/// Built-in tiers: `free` caps concurrency at 4 agents, `premium` at 16.
/// Neither restricts capabilities or backends.
pub fn default_tiers() -> Vec<TierPolicy> {
    vec![
        TierPolicy::new("free", 4),
        TierPolicy::new("premium", 16),
    ]
}

/// The standard delivery pipeline: validate, test, review, deploy,
/// integrate. Each stage requires the matching capability tag.
pub fn default_stages() -> Vec<StageDescriptor> {
    ["validate", "test", "review", "deploy", "integrate"]
        .iter()
        .map(|name| StageDescriptor::new(*name, [CapabilityTag::from(*name)]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_line_up() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.backend_id, "local");
        assert_eq!(config.tiers.len(), 2);
        assert_eq!(config.tiers[0].max_concurrent_agents, 4);
        assert_eq!(config.execution_timeout(), Duration::from_millis(30_000));
    }

    #[test]
    fn default_pipeline_has_five_stages() {
        let stages = default_stages();
        assert_eq!(stages.len(), 5);
        assert_eq!(stages[0].name, "validate");
        assert_eq!(stages[4].name, "integrate");
        assert!(stages[1]
            .required_capabilities
            .contains(&CapabilityTag::from("test")));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = OrchestratorConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.tiers[1].tier_name, "premium");
        assert_eq!(back.admission.max_attempts, 10);
    }
}
