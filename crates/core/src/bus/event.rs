//! # Events
//!
//! The immutable records the bus delivers, plus the well-known topic names
//! the core publishes lifecycle notifications on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event published on the bus
///
/// Immutable once published; subscribers receive clones. The `id` exists so
/// handlers can de-duplicate under at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: String,
    /// Topic the event was published on
    pub topic: String,
    /// Identifier of the publisher
    pub source_id: String,
    /// Publish timestamp
    pub timestamp: DateTime<Utc>,
    /// Structured payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event
    pub fn new(topic: &str, source_id: &str, payload: serde_json::Value) -> Self {
        Self {
            id: event_id(),
            topic: topic.to_string(),
            source_id: source_id.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Generate a simple unique event ID
fn event_id() -> String {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    format!("{:x}-{:x}", nanos, rand_u32())
}

/// Simple random number (not cryptographic)
fn rand_u32() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

/// Well-known topics for lifecycle events, plus builders for the per-task
/// A2A protocol topics.
pub mod topics {
    pub const SESSION_STARTED: &str = "session.started";
    pub const SESSION_PAUSED: &str = "session.paused";
    pub const SESSION_RESUMED: &str = "session.resumed";
    pub const SESSION_STOPPED: &str = "session.stopped";
    pub const SESSION_COMPLETED: &str = "session.completed";
    pub const NODE_ASSIGNED: &str = "node.assigned";
    pub const NODE_COMPLETED: &str = "node.completed";
    pub const NODE_RETRYING: &str = "node.retrying";
    pub const NODE_ESCALATED: &str = "node.escalated";
    pub const GATE_DENIED: &str = "gate.denied";
    pub const HANDOFF_COMPLETED: &str = "handoff.completed";
    pub const HANDOFF_FAILED: &str = "handoff.failed";

    /// Handshake requests addressed to one agent
    pub fn a2a_handshake(agent_id: &str) -> String {
        format!("a2a.handshake.{agent_id}")
    }

    /// Handshake responses for one handoff transaction
    pub fn a2a_response(task_id: &str) -> String {
        format!("a2a.response.{task_id}")
    }

    /// Context snapshot transfer for one handoff transaction
    pub fn a2a_transfer(task_id: &str) -> String {
        format!("a2a.transfer.{task_id}")
    }

    /// Transfer receipt confirmation for one handoff transaction
    pub fn a2a_confirm(task_id: &str) -> String {
        format!("a2a.confirm.{task_id}")
    }

    /// Cancellation signal for one handoff transaction
    pub fn a2a_cancel(task_id: &str) -> String {
        format!("a2a.cancel.{task_id}")
    }

    /// Execution orders addressed to one agent
    pub fn exec_order(agent_id: &str) -> String {
        format!("exec.order.{agent_id}")
    }

    /// Stage results for one task node
    pub fn exec_result(task_id: &str) -> String {
        format!("exec.result.{task_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_unique() {
        let a = Event::new("t", "s", serde_json::Value::Null);
        let b = Event::new("t", "s", serde_json::Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_topic_builders() {
        assert_eq!(topics::a2a_handshake("agent-1"), "a2a.handshake.agent-1");
        assert_eq!(topics::exec_result("n-3"), "exec.result.n-3");
    }
}
