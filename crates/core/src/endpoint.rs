//! # Agent Endpoint
//!
//! The agent-side protocol pump. Each in-process agent runs one endpoint
//! task that answers handshakes against its own descriptor, confirms
//! context transfers after dereferencing the snapshot through the memory
//! engine, and executes stage orders through its backend - publishing the
//! result back on the bus.
//!
//! An endpoint services one handoff at a time, which is exactly the core
//! invariant: at most one task node is assigned to a given agent at any
//! instant.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agents::AgentDescriptor;
use crate::backend::{AgentBackend, ExecutionOrder, StageOutput};
use crate::bus::{topics, EventBus};
use crate::mediator::{HandshakeRequest, HandshakeResponse, TransferConfirm, TransferEnvelope};
use crate::memory::MemoryEngine;

/// Handle for a spawned endpoint
pub struct EndpointHandle {
    pub agent_id: String,
    pub task_handle: JoinHandle<()>,
}

impl EndpointHandle {
    /// Stop the endpoint task
    pub fn shutdown(&self) {
        self.task_handle.abort();
    }
}

/// Spawn the protocol pump for one agent
pub fn spawn_agent(
    descriptor: AgentDescriptor,
    backend: Arc<dyn AgentBackend>,
    bus: Arc<EventBus>,
    memory: Arc<dyn MemoryEngine>,
) -> EndpointHandle {
    let agent_id = descriptor.agent_id.clone();
    let mut handshakes = bus.subscribe(&topics::a2a_handshake(&agent_id));
    let mut orders = bus.subscribe(&topics::exec_order(&agent_id));

    let task_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                ev = handshakes.recv() => {
                    let Some(ev) = ev else { break };
                    let Ok(request) = serde_json::from_value::<HandshakeRequest>(ev.payload) else {
                        continue;
                    };
                    answer_handshake(&descriptor, &bus, &memory, request).await;
                }
                ev = orders.recv() => {
                    let Some(ev) = ev else { break };
                    let Ok(order) = serde_json::from_value::<ExecutionOrder>(ev.payload) else {
                        continue;
                    };
                    execute_order(&descriptor, backend.as_ref(), &bus, &memory, order).await;
                }
            }
        }
        tracing::debug!(agent_id = %descriptor.agent_id, "endpoint shut down");
    });

    EndpointHandle {
        agent_id,
        task_handle,
    }
}

/// Validate a handshake against our descriptor, ack or reject, and if
/// acked, confirm the subsequent context transfer.
async fn answer_handshake(
    descriptor: &AgentDescriptor,
    bus: &EventBus,
    memory: &Arc<dyn MemoryEngine>,
    request: HandshakeRequest,
) {
    let reject_reason = if request.protocol_version != crate::mediator::PROTOCOL_VERSION {
        Some(format!(
            "unsupported protocol version {}",
            request.protocol_version
        ))
    } else if !descriptor.can_serve(&request.capabilities_required) {
        let missing: Vec<String> = request
            .capabilities_required
            .iter()
            .filter(|c| !descriptor.capabilities.contains(c))
            .map(|c| c.to_string())
            .collect();
        Some(format!("missing capabilities: {}", missing.join(", ")))
    } else {
        None
    };

    let accepted = reject_reason.is_none();
    bus.publish_json(
        &topics::a2a_response(&request.task_id),
        &descriptor.agent_id,
        &HandshakeResponse {
            task_id: request.task_id.clone(),
            agent_id: descriptor.agent_id.clone(),
            accepted,
            reject_reason,
        },
    );
    if !accepted {
        return;
    }

    // Await the transfer; the deadline bounds our snapshot dereference too.
    let mut transfers = bus.subscribe(&topics::a2a_transfer(&request.task_id));
    let deadline = Duration::from_millis(request.deadline_ms);
    let envelope = loop {
        match tokio::time::timeout(deadline, transfers.recv()).await {
            Ok(Some(ev)) => {
                if let Ok(envelope) = serde_json::from_value::<TransferEnvelope>(ev.payload) {
                    if envelope.to_agent_id == descriptor.agent_id {
                        break envelope;
                    }
                }
            }
            Ok(None) | Err(_) => {
                tracing::debug!(
                    agent_id = %descriptor.agent_id,
                    task_id = %request.task_id,
                    "no transfer arrived after ack"
                );
                return;
            }
        }
    };

    let confirm = match memory.retrieve(&envelope.context_snapshot_ref).await {
        Ok(_) => TransferConfirm {
            task_id: envelope.task_id.clone(),
            agent_id: descriptor.agent_id.clone(),
            received: true,
            error: None,
        },
        Err(e) => TransferConfirm {
            task_id: envelope.task_id.clone(),
            agent_id: descriptor.agent_id.clone(),
            received: false,
            error: Some(e.to_string()),
        },
    };
    bus.publish_json(
        &topics::a2a_confirm(&envelope.task_id),
        &descriptor.agent_id,
        &confirm,
    );
}

/// Run a stage through the backend and publish the result
async fn execute_order(
    descriptor: &AgentDescriptor,
    backend: &dyn AgentBackend,
    bus: &EventBus,
    memory: &Arc<dyn MemoryEngine>,
    order: ExecutionOrder,
) {
    let context = match &order.context_snapshot_ref {
        Some(snapshot_ref) => match memory.retrieve(snapshot_ref).await {
            Ok(value) => Some(value),
            Err(e) => {
                publish_result(
                    bus,
                    StageOutput {
                        task_id: order.task_id.clone(),
                        agent_id: descriptor.agent_id.clone(),
                        stage_name: order.stage_name.clone(),
                        success: false,
                        output: serde_json::Value::Null,
                        error: Some(format!("context unavailable: {e}")),
                    },
                );
                return;
            }
        },
        None => None,
    };

    let output = match backend.execute(&order, context).await {
        Ok(value) => StageOutput {
            task_id: order.task_id.clone(),
            agent_id: descriptor.agent_id.clone(),
            stage_name: order.stage_name.clone(),
            success: true,
            output: value,
            error: None,
        },
        Err(e) => StageOutput {
            task_id: order.task_id.clone(),
            agent_id: descriptor.agent_id.clone(),
            stage_name: order.stage_name.clone(),
            success: false,
            output: serde_json::Value::Null,
            error: Some(e.to_string()),
        },
    };
    publish_result(bus, output);
}

fn publish_result(bus: &EventBus, output: StageOutput) {
    let topic = topics::exec_result(&output.task_id);
    let agent_id = output.agent_id.clone();
    bus.publish_json(&topic, &agent_id, &output);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::CapabilityTag;
    use crate::mediator::PROTOCOL_VERSION;
    use crate::memory::InMemorySnapshots;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;

    struct EchoBackend;

    #[async_trait]
    impl AgentBackend for EchoBackend {
        async fn execute(
            &self,
            order: &ExecutionOrder,
            context: Option<serde_json::Value>,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(json!({ "stage": order.stage_name, "context": context }))
        }
    }

    fn caps(tags: &[&str]) -> BTreeSet<CapabilityTag> {
        tags.iter().map(|t| CapabilityTag::from(*t)).collect()
    }

    #[tokio::test]
    async fn test_endpoint_acks_and_confirms_transfer() {
        let bus = Arc::new(EventBus::new());
        let memory: Arc<dyn MemoryEngine> = Arc::new(InMemorySnapshots::new());
        memory.store("ctx-1", json!({"goal": "g"})).await.unwrap();

        let descriptor = AgentDescriptor::new("a1").with_capabilities(["test"]);
        let _handle = spawn_agent(
            descriptor,
            Arc::new(EchoBackend),
            Arc::clone(&bus),
            Arc::clone(&memory),
        );

        let mut responses = bus.subscribe(&topics::a2a_response("n1"));
        let mut confirms = bus.subscribe(&topics::a2a_confirm("n1"));

        bus.publish_json(
            &topics::a2a_handshake("a1"),
            "mediator",
            &HandshakeRequest {
                task_id: "n1".to_string(),
                from_agent_id: "a0".to_string(),
                to_agent_id: "a1".to_string(),
                protocol_version: PROTOCOL_VERSION,
                capabilities_required: caps(&["test"]),
                context_snapshot_ref: "ctx-1".to_string(),
                deadline_ms: 500,
            },
        );

        let response: HandshakeResponse =
            serde_json::from_value(responses.recv().await.expect("response").payload).unwrap();
        assert!(response.accepted);

        bus.publish_json(
            &topics::a2a_transfer("n1"),
            "mediator",
            &TransferEnvelope {
                task_id: "n1".to_string(),
                to_agent_id: "a1".to_string(),
                context_snapshot_ref: "ctx-1".to_string(),
            },
        );
        let confirm: TransferConfirm =
            serde_json::from_value(confirms.recv().await.expect("confirm").payload).unwrap();
        assert!(confirm.received);
    }

    #[tokio::test]
    async fn test_endpoint_rejects_missing_capability() {
        let bus = Arc::new(EventBus::new());
        let memory: Arc<dyn MemoryEngine> = Arc::new(InMemorySnapshots::new());
        let _handle = spawn_agent(
            AgentDescriptor::new("a1").with_capabilities(["validate"]),
            Arc::new(EchoBackend),
            Arc::clone(&bus),
            memory,
        );

        let mut responses = bus.subscribe(&topics::a2a_response("n1"));
        bus.publish_json(
            &topics::a2a_handshake("a1"),
            "mediator",
            &HandshakeRequest {
                task_id: "n1".to_string(),
                from_agent_id: "a0".to_string(),
                to_agent_id: "a1".to_string(),
                protocol_version: PROTOCOL_VERSION,
                capabilities_required: caps(&["deploy"]),
                context_snapshot_ref: "ctx-1".to_string(),
                deadline_ms: 500,
            },
        );

        let response: HandshakeResponse =
            serde_json::from_value(responses.recv().await.expect("response").payload).unwrap();
        assert!(!response.accepted);
        assert!(response.reject_reason.unwrap().contains("deploy"));
    }

    #[tokio::test]
    async fn test_endpoint_reports_unavailable_snapshot() {
        let bus = Arc::new(EventBus::new());
        let memory: Arc<dyn MemoryEngine> = Arc::new(InMemorySnapshots::new());
        let _handle = spawn_agent(
            AgentDescriptor::new("a1").with_capabilities(["test"]),
            Arc::new(EchoBackend),
            Arc::clone(&bus),
            memory,
        );

        let mut responses = bus.subscribe(&topics::a2a_response("n1"));
        let mut confirms = bus.subscribe(&topics::a2a_confirm("n1"));
        bus.publish_json(
            &topics::a2a_handshake("a1"),
            "mediator",
            &HandshakeRequest {
                task_id: "n1".to_string(),
                from_agent_id: "a0".to_string(),
                to_agent_id: "a1".to_string(),
                protocol_version: PROTOCOL_VERSION,
                capabilities_required: caps(&["test"]),
                context_snapshot_ref: "ctx-missing".to_string(),
                deadline_ms: 500,
            },
        );
        assert!(
            serde_json::from_value::<HandshakeResponse>(
                responses.recv().await.expect("response").payload
            )
            .unwrap()
            .accepted
        );

        bus.publish_json(
            &topics::a2a_transfer("n1"),
            "mediator",
            &TransferEnvelope {
                task_id: "n1".to_string(),
                to_agent_id: "a1".to_string(),
                context_snapshot_ref: "ctx-missing".to_string(),
            },
        );
        let confirm: TransferConfirm =
            serde_json::from_value(confirms.recv().await.expect("confirm").payload).unwrap();
        assert!(!confirm.received);
    }

    #[tokio::test]
    async fn test_endpoint_executes_and_publishes_result() {
        let bus = Arc::new(EventBus::new());
        let memory: Arc<dyn MemoryEngine> = Arc::new(InMemorySnapshots::new());
        memory.store("ctx-1", json!({"k": 1})).await.unwrap();
        let _handle = spawn_agent(
            AgentDescriptor::new("a1").with_capabilities(["test"]),
            Arc::new(EchoBackend),
            Arc::clone(&bus),
            memory,
        );

        let mut results = bus.subscribe(&topics::exec_result("n1"));
        bus.publish_json(
            &topics::exec_order("a1"),
            "orchestrator",
            &ExecutionOrder {
                task_id: "n1".to_string(),
                session_id: "s1".to_string(),
                stage_name: "test".to_string(),
                agent_id: "a1".to_string(),
                context_snapshot_ref: Some("ctx-1".to_string()),
            },
        );

        let output: StageOutput =
            serde_json::from_value(results.recv().await.expect("result").payload).unwrap();
        assert!(output.success);
        assert_eq!(output.output["context"]["k"], 1);
    }
}
