//! # Error Taxonomy
//!
//! Core error kinds and their propagation policy:
//! - `FeatureGateDenied` and `HandshakeTimeout` are recovered locally by the
//!   orchestrator via bounded retry.
//! - `CapabilityMismatch` and `SnapshotUnavailable` trigger immediate agent
//!   re-selection through the router, never a retry against the same agent.
//! - `AgentExecutionFailure` rides the quality-gate retry-then-escalate path.
//! - `InvalidTransition` and `SessionNotFound` are caller errors, surfaced
//!   immediately and never retried.

use crate::gate::DenialReason;

/// Errors produced by the orchestration core
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// No handshake acknowledgment arrived before the deadline
    #[error("handshake with agent '{agent_id}' timed out after {deadline_ms}ms")]
    HandshakeTimeout { agent_id: String, deadline_ms: u64 },

    /// Responder rejected the handshake because it lacks required capabilities
    #[error("agent '{agent_id}' rejected handshake: {reason}")]
    CapabilityMismatch { agent_id: String, reason: String },

    /// Feature gate refused an agent slot (a normal, expected outcome)
    #[error("feature gate denied admission for tier '{tier}': {reason}")]
    FeatureGateDenied { tier: String, reason: DenialReason },

    /// The assigned agent reported a failed stage execution
    #[error("agent '{agent_id}' failed stage '{stage}': {message}")]
    AgentExecutionFailure {
        agent_id: String,
        stage: String,
        message: String,
    },

    /// The context snapshot reference could not be dereferenced in time
    #[error("context snapshot '{snapshot_ref}' could not be dereferenced")]
    SnapshotUnavailable { snapshot_ref: String },

    /// Attempted stage skip/rewind or an illegal state-machine move
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Unknown or already-terminal session id
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Router found no candidate for the stage's capability set
    #[error("no agent available for stage '{stage}'")]
    NoAgentAvailable { stage: String },

    /// The transaction was cancelled (session stop)
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Short machine-readable kind, used in status reports and event payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::CapabilityMismatch { .. } => "capability_mismatch",
            Self::FeatureGateDenied { .. } => "feature_gate_denied",
            Self::AgentExecutionFailure { .. } => "agent_execution_failure",
            Self::SnapshotUnavailable { .. } => "snapshot_unavailable",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::SessionNotFound(_) => "session_not_found",
            Self::NoAgentAvailable { .. } => "no_agent_available",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = CoreError::SessionNotFound("sess-1".to_string());
        assert_eq!(err.kind(), "session_not_found");
        assert!(err.to_string().contains("sess-1"));
    }

    #[test]
    fn test_denial_is_displayed() {
        let err = CoreError::FeatureGateDenied {
            tier: "free".to_string(),
            reason: DenialReason::AgentLimitExceeded,
        };
        assert!(err.to_string().contains("free"));
    }
}
