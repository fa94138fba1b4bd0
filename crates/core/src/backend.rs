//! # Agent Backend Seam
//!
//! The model/agent backend is an external collaborator: the core only
//! specifies "execute stage with context, report a result". Results flow
//! back through the event bus within a bounded time or the orchestrator
//! treats the execution as timed out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An execution order dispatched to the confirmed owner of a task node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOrder {
    /// Task node this order is for
    pub task_id: String,
    /// Owning session
    pub session_id: String,
    /// Stage to execute
    pub stage_name: String,
    /// Agent the order is addressed to
    pub agent_id: String,
    /// Reference to the context snapshot for this stage, if any
    #[serde(default)]
    pub context_snapshot_ref: Option<String>,
}

/// Result of one stage execution, published on `exec.result.{task_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    pub task_id: String,
    pub agent_id: String,
    pub stage_name: String,
    pub success: bool,
    /// Stage output, fed to the quality gate and snapshotted as the next
    /// stage's context
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// Backend invoked by an agent endpoint to do the actual work of a stage
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Execute the stage against the dereferenced context. An `Err` is
    /// reported as an agent execution failure, which rides the stage's
    /// quality-gate retry path.
    async fn execute(
        &self,
        order: &ExecutionOrder,
        context: Option<serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value>;
}
