//! The server's built-in execution backend. Stands in for a real model or
//! tool integration: it acknowledges the stage and echoes the context it
//! was handed, so the pipeline is fully exercisable end to end.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use synapse_core::{AgentBackend, ExecutionOrder};

#[derive(Default)]
pub struct LocalBackend;

#[async_trait]
impl AgentBackend for LocalBackend {
    async fn execute(
        &self,
        order: &ExecutionOrder,
        context: Option<Value>,
    ) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracing::debug!(
            agent_id = %order.agent_id,
            stage = %order.stage_name,
            "local backend executing stage"
        );
        Ok(json!({
            "stage": order.stage_name,
            "session_id": order.session_id,
            "context": context.unwrap_or(Value::Null),
            "summary": format!("{} completed by {}", order.stage_name, order.agent_id),
        }))
    }
}
