//! # Task Tree
//!
//! The ordered chain of named stages executed to satisfy one goal. The
//! chain is data, not code: each stage is a descriptor carrying its
//! required capabilities, its quality gate, and its retry policy. The tree
//! never revisits a stage out of order; retries re-run the same stage.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agents::CapabilityTag;
use crate::backend::StageOutput;
use crate::error::CoreError;

/// Pass/fail predicate over a stage's output
pub type QualityGate = Arc<dyn Fn(&StageOutput) -> bool + Send + Sync>;

/// Retry policy for one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before the node escalates
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_ms: 100,
        }
    }
}

/// One stage in the chain
#[derive(Clone)]
pub struct StageDescriptor {
    pub name: String,
    pub required_capabilities: BTreeSet<CapabilityTag>,
    pub quality_gate: QualityGate,
    pub retry: RetryPolicy,
}

impl StageDescriptor {
    /// New stage whose quality gate is the backend's own success flag
    pub fn new<I, T>(name: impl Into<String>, required: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CapabilityTag>,
    {
        Self {
            name: name.into(),
            required_capabilities: required.into_iter().map(Into::into).collect(),
            quality_gate: Arc::new(|output| output.success),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_quality_gate(
        mut self,
        gate: impl Fn(&StageOutput) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.quality_gate = Arc::new(gate);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl std::fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("required_capabilities", &self.required_capabilities)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Status of one task node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Escalated,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Escalated)
    }
}

/// One node in the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub node_id: String,
    pub stage_name: String,
    pub status: NodeStatus,
    /// The confirmed owner; updated only after a handoff COMPLETED receipt
    pub assigned_agent_id: Option<String>,
    pub attempt_count: u32,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
}

impl TaskNode {
    /// Guarded status transition; stage skips and rewinds are rejected
    pub fn transition(&mut self, next: NodeStatus) -> Result<(), CoreError> {
        use NodeStatus::*;
        let allowed = matches!(
            (self.status, next),
            (Pending, Assigned)
                | (Pending, Escalated)
                | (Pending, Failed)
                | (Assigned, Running)
                | (Assigned, Retrying)
                | (Assigned, Failed)
                | (Assigned, Escalated)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Escalated)
                | (Retrying, Assigned)
                | (Retrying, Escalated)
                | (Retrying, Failed)
        );
        if !allowed {
            return Err(CoreError::InvalidTransition(format!(
                "node {}: {:?} -> {:?}",
                self.node_id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// The chain of task nodes for one session
#[derive(Debug, Clone)]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
    cursor: usize,
}

impl TaskTree {
    /// Build the chain for a session: one node per stage, each with exactly
    /// one predecessor and successor.
    pub fn from_stages(session_id: &str, stages: &[StageDescriptor]) -> Self {
        let node_id = |idx: usize| format!("{session_id}-n{idx}");
        let nodes = stages
            .iter()
            .enumerate()
            .map(|(idx, stage)| TaskNode {
                node_id: node_id(idx),
                stage_name: stage.name.clone(),
                status: NodeStatus::Pending,
                assigned_agent_id: None,
                attempt_count: 0,
                parent_id: (idx > 0).then(|| node_id(idx - 1)),
                child_ids: if idx + 1 < stages.len() {
                    vec![node_id(idx + 1)]
                } else {
                    Vec::new()
                },
            })
            .collect();
        Self { nodes, cursor: 0 }
    }

    /// Index of the stage currently being executed
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The node at the cursor, if the chain is not exhausted
    pub fn current(&self) -> Option<&TaskNode> {
        self.nodes.get(self.cursor)
    }

    pub fn current_mut(&mut self) -> Option<&mut TaskNode> {
        self.nodes.get_mut(self.cursor)
    }

    /// Advance past the current node. Only legal once it has succeeded;
    /// the cursor is monotonic, so the chain can never rewind.
    pub fn advance(&mut self) -> Result<(), CoreError> {
        match self.current() {
            Some(node) if node.status == NodeStatus::Succeeded => {
                self.cursor += 1;
                Ok(())
            }
            Some(node) => Err(CoreError::InvalidTransition(format!(
                "cannot advance past node {} in status {:?}",
                node.node_id, node.status
            ))),
            None => Err(CoreError::InvalidTransition(
                "cannot advance an exhausted chain".to_string(),
            )),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.nodes.len()
    }

    /// Snapshot copy for status queries (single-writer discipline: only the
    /// session's engine mutates the tree)
    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages() -> Vec<StageDescriptor> {
        vec![
            StageDescriptor::new("validate", ["validate"]),
            StageDescriptor::new("test", ["test"]),
            StageDescriptor::new("review", ["review"]),
        ]
    }

    #[test]
    fn test_chain_links() {
        let tree = TaskTree::from_stages("s1", &stages());
        let nodes = tree.nodes();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].parent_id, None);
        assert_eq!(nodes[0].child_ids, vec!["s1-n1".to_string()]);
        assert_eq!(nodes[1].parent_id, Some("s1-n0".to_string()));
        assert!(nodes[2].child_ids.is_empty());
    }

    #[test]
    fn test_advance_requires_success() {
        let mut tree = TaskTree::from_stages("s1", &stages());
        assert!(tree.advance().is_err());

        let node = tree.current_mut().unwrap();
        node.transition(NodeStatus::Assigned).unwrap();
        node.transition(NodeStatus::Running).unwrap();
        node.transition(NodeStatus::Succeeded).unwrap();
        tree.advance().unwrap();
        assert_eq!(tree.cursor(), 1);
    }

    #[test]
    fn test_no_skip_or_rewind_transitions() {
        let mut node = TaskTree::from_stages("s1", &stages())
            .current()
            .cloned()
            .unwrap();
        // Pending cannot jump straight to Running or Succeeded.
        assert!(node.transition(NodeStatus::Running).is_err());
        assert!(node.transition(NodeStatus::Succeeded).is_err());

        node.transition(NodeStatus::Assigned).unwrap();
        node.transition(NodeStatus::Running).unwrap();
        node.transition(NodeStatus::Succeeded).unwrap();
        // Terminal nodes never move again.
        assert!(node.transition(NodeStatus::Running).is_err());
    }

    #[test]
    fn test_retry_cycle() {
        let mut tree = TaskTree::from_stages("s1", &stages());
        let node = tree.current_mut().unwrap();
        node.transition(NodeStatus::Assigned).unwrap();
        node.transition(NodeStatus::Running).unwrap();
        node.transition(NodeStatus::Retrying).unwrap();
        node.attempt_count += 1;
        node.transition(NodeStatus::Assigned).unwrap();
        assert_eq!(node.attempt_count, 1);
        // The cursor did not move: retries re-run the same stage.
        assert_eq!(tree.cursor(), 0);
    }

    #[test]
    fn test_default_quality_gate_uses_success_flag() {
        let stage = StageDescriptor::new("test", ["test"]);
        let passing = StageOutput {
            task_id: "n".into(),
            agent_id: "a".into(),
            stage_name: "test".into(),
            success: true,
            output: serde_json::Value::Null,
            error: None,
        };
        assert!((stage.quality_gate)(&passing));
        let failing = StageOutput {
            success: false,
            ..passing
        };
        assert!(!(stage.quality_gate)(&failing));
    }
}
