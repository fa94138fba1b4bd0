//! # Session Engine
//!
//! The per-session driving loop. Each started session gets one engine task
//! that owns the task tree outright and walks the chain: admit a slot from
//! the feature gate, select an agent through the router, hand off (or
//! dispatch directly for the first stage), await the completion event with
//! a bounded timeout, evaluate the quality gate, then advance, retry, or
//! escalate.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::{ExecutionOrder, StageOutput};
use crate::bus::{topics, EventBus};
use crate::config::OrchestratorConfig;
use crate::error::CoreError;
use crate::gate::{Admission, DenialReason, FeatureGate};
use crate::mediator::Mediator;
use crate::memory::MemoryEngine;
use crate::router::MoeRouter;
use crate::state::{SessionArchive, SessionRecord, SynapseDb};

use super::session::{Session, SessionCommand, SessionState, SessionStatus};
use super::task_tree::{NodeStatus, StageDescriptor, TaskTree};

/// Shared collaborators handed to every engine
#[derive(Clone)]
pub(crate) struct EngineDeps {
    pub bus: Arc<EventBus>,
    pub gate: Arc<FeatureGate>,
    pub router: Arc<MoeRouter>,
    pub mediator: Arc<Mediator>,
    pub memory: Arc<dyn MemoryEngine>,
    pub db: Option<Arc<SynapseDb>>,
    pub config: Arc<OrchestratorConfig>,
    pub stages: Arc<Vec<StageDescriptor>>,
}

/// Channel endpoints the registry keeps for one running engine
pub(crate) struct EngineHandle {
    pub command_tx: mpsc::Sender<SessionCommand>,
    pub status_rx: watch::Receiver<SessionStatus>,
    pub task: JoinHandle<()>,
}

/// Spawn the engine task for a session
pub(crate) fn spawn(session: Session, deps: EngineDeps) -> EngineHandle {
    let (command_tx, command_rx) = mpsc::channel(8);
    let (status_tx, status_rx) = watch::channel(SessionStatus::initial(&session.session_id));
    let engine = SessionEngine {
        context_ref: String::new(),
        current_owner: None,
        pending_pause: false,
        session,
        deps,
        command_rx,
        status_tx,
    };
    let task = tokio::spawn(engine.run());
    EngineHandle {
        command_tx,
        status_rx,
        task,
    }
}

/// How the overall run ended
enum Outcome {
    Completed,
    Stopped,
}

/// What to do after processing one node
enum NodeFlow {
    Advanced,
    Escalated,
    Stopped,
}

/// What to do after one failed attempt at a stage
enum AttemptFlow {
    Retry,
    Escalated,
}

/// Command-loop verdict
#[derive(PartialEq)]
enum Flow {
    Continue,
    Stopped,
}

struct SessionEngine {
    session: Session,
    deps: EngineDeps,
    command_rx: mpsc::Receiver<SessionCommand>,
    status_tx: watch::Sender<SessionStatus>,
    /// Reference to the context snapshot the next stage starts from
    context_ref: String,
    /// Confirmed owner of the in-flight node, if any
    current_owner: Option<String>,
    pending_pause: bool,
}

impl SessionEngine {
    #[tracing::instrument(skip(self), fields(session_id = %self.session.session_id))]
    async fn run(mut self) {
        let session_id = self.session.session_id.clone();
        self.deps.bus.publish(
            topics::SESSION_STARTED,
            &session_id,
            json!({
                "session_id": session_id,
                "goal": self.session.goal,
                "tier": self.session.tier,
            }),
        );

        // Seed the first stage's context with the goal.
        let goal_ref = format!("ctx-{session_id}-goal");
        if let Err(e) = self
            .deps
            .memory
            .store(&goal_ref, json!({ "goal": self.session.goal }))
            .await
        {
            tracing::warn!(error = %e, "failed to store goal snapshot");
        }
        self.context_ref = goal_ref;

        let mut tree = TaskTree::from_stages(&session_id, &self.deps.stages);
        let outcome = loop {
            if tree.is_complete() {
                break Outcome::Completed;
            }
            if self.drain_commands() == Flow::Stopped {
                break Outcome::Stopped;
            }
            if self.pending_pause && self.wait_while_paused().await == Flow::Stopped {
                break Outcome::Stopped;
            }

            match self.process_current_node(&mut tree).await {
                NodeFlow::Advanced => continue,
                NodeFlow::Escalated => {
                    // The chain cannot proceed past an escalated gate; the
                    // session stays active awaiting external resolution.
                    if self.park().await == Flow::Stopped {
                        break Outcome::Stopped;
                    }
                }
                NodeFlow::Stopped => break Outcome::Stopped,
            }
        };

        self.finish(outcome, &tree);
    }

    /// Admission wrapper: one slot per node, released on every exit path
    async fn process_current_node(&mut self, tree: &mut TaskTree) -> NodeFlow {
        let stage = self.deps.stages[tree.cursor()].clone();
        let tier = self.session.tier.clone();

        if let Some(node) = tree.current() {
            let stage_name = stage.name.clone();
            let node_status = node.status;
            self.set_status(move |s| {
                s.current_stage = Some(stage_name);
                s.node_status = Some(node_status);
            });
        }

        match self.admit(&stage, tree).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stopped) => return NodeFlow::Stopped,
            Err(flow) => return flow,
        }

        let flow = self.execute_admitted_node(&stage, tree).await;
        self.deps.gate.release(&tier);
        flow
    }

    /// Request a slot from the feature gate with bounded retry. Limit
    /// denials back off and retry (queuing the node); policy denials can
    /// never succeed, so the node escalates immediately. A pause parks the
    /// loop and resets the retry window, so a paused session never burns
    /// through its denial budget.
    async fn admit(
        &mut self,
        stage: &StageDescriptor,
        tree: &mut TaskTree,
    ) -> Result<Flow, NodeFlow> {
        let tier = self.session.tier.clone();
        let policy = self.deps.config.admission.clone();

        let mut denials = 0;
        loop {
            if self.pending_pause {
                match self.wait_while_paused().await {
                    Flow::Stopped => return Ok(Flow::Stopped),
                    Flow::Continue => denials = 0,
                }
            }

            match self.deps.gate.try_admit(
                &tier,
                &stage.required_capabilities,
                &self.deps.config.backend_id,
            ) {
                Admission::Granted => return Ok(Flow::Continue),
                Admission::Denied(reason) => {
                    let err = CoreError::FeatureGateDenied { tier: tier.clone(), reason };
                    self.deps.bus.publish(
                        topics::GATE_DENIED,
                        &self.session.session_id,
                        json!({
                            "session_id": self.session.session_id,
                            "stage": stage.name,
                            "tier": tier,
                            "reason": reason,
                        }),
                    );
                    let message = err.to_string();
                    self.set_status(move |s| {
                        s.last_error = Some(message);
                        s.node_status = Some(NodeStatus::Pending);
                    });

                    if reason != DenialReason::AgentLimitExceeded {
                        return Err(flow_from_attempt(self.escalate_node(tree, stage, err)));
                    }
                    denials += 1;
                    if denials >= policy.max_attempts {
                        return Err(flow_from_attempt(self.escalate_node(tree, stage, err)));
                    }
                    if self.sleep_or_command(Duration::from_millis(policy.backoff_ms)).await
                        == Flow::Stopped
                    {
                        return Ok(Flow::Stopped);
                    }
                }
            }
        }
    }

    /// Drive one admitted node to success, escalation, or stop
    async fn execute_admitted_node(
        &mut self,
        stage: &StageDescriptor,
        tree: &mut TaskTree,
    ) -> NodeFlow {
        let tier = self.session.tier.clone();
        let mut excluded: BTreeSet<String> = BTreeSet::new();

        loop {
            let Some(target) = self.deps.router.select_agent(
                &stage.name,
                &stage.required_capabilities,
                &tier,
                &excluded,
            ) else {
                let err = CoreError::NoAgentAvailable {
                    stage: stage.name.clone(),
                };
                return flow_from_attempt(self.escalate_node(tree, stage, err));
            };

            let node_id = match tree.current() {
                Some(node) => node.node_id.clone(),
                None => return NodeFlow::Advanced,
            };
            if let Some(node) = tree.current_mut() {
                if let Err(e) = node.transition(NodeStatus::Assigned) {
                    tracing::error!(error = %e, "node assignment transition rejected");
                    return NodeFlow::Stopped;
                }
            }

            // Handoff is only needed when ownership actually moves between
            // two distinct agents; the first stage (or a re-run on the same
            // agent) is a same-process dispatch.
            let owner = match self.current_owner.clone() {
                Some(prev) if prev != target.agent_id => {
                    // Stay responsive while the handoff is in flight: a stop
                    // publishes the cancel signal so the transaction resolves
                    // as failed now instead of running out its deadline
                    // budget. The mediator keeps `excluded` current, so a
                    // candidate that failed never sees another handshake for
                    // this node.
                    let mut stopping = false;
                    let outcome = {
                        let negotiation = self.deps.mediator.negotiate(
                            &node_id,
                            &prev,
                            &stage.name,
                            &stage.required_capabilities,
                            &self.context_ref,
                            &self.deps.router,
                            &tier,
                            &mut excluded,
                        );
                        tokio::pin!(negotiation);
                        loop {
                            tokio::select! {
                                res = &mut negotiation => break res,
                                cmd = self.command_rx.recv() => match cmd {
                                    Some(SessionCommand::Stop) | None => {
                                        stopping = true;
                                        self.deps.bus.publish(
                                            &topics::a2a_cancel(&node_id),
                                            &self.session.session_id,
                                            json!({ "reason": "session stopped" }),
                                        );
                                    }
                                    Some(SessionCommand::Pause) => self.pending_pause = true,
                                    Some(SessionCommand::Resume) => self.pending_pause = false,
                                },
                            }
                        }
                    };
                    if stopping {
                        self.fail_node_cancelled(tree);
                        return NodeFlow::Stopped;
                    }
                    match outcome {
                        Ok(receipt) => receipt.owner_agent_id,
                        Err(CoreError::Cancelled) => {
                            self.fail_node_cancelled(tree);
                            return NodeFlow::Stopped;
                        }
                        Err(err) => {
                            match self.register_attempt_failure(tree, stage, err).await {
                                AttemptFlow::Retry => continue,
                                AttemptFlow::Escalated => return NodeFlow::Escalated,
                            }
                        }
                    }
                }
                _ => target.agent_id.clone(),
            };

            // Ownership confirmed: record the assignment and dispatch.
            if let Some(node) = tree.current_mut() {
                node.assigned_agent_id = Some(owner.clone());
            }
            self.current_owner = Some(owner.clone());
            self.deps.router.adjust_load(&owner, 1);
            self.deps.bus.publish(
                topics::NODE_ASSIGNED,
                &self.session.session_id,
                json!({ "node_id": node_id, "stage": stage.name, "agent_id": owner }),
            );

            let attempt = self.dispatch_and_await(stage, tree, &node_id, &owner).await;
            self.deps.router.adjust_load(&owner, -1);

            match attempt {
                Ok(output) if output.success && (stage.quality_gate)(&output) => {
                    self.deps.router.record_outcome(&owner, true);
                    return self.complete_node(stage, tree, &node_id, output).await;
                }
                Ok(output) => {
                    self.deps.router.record_outcome(&owner, false);
                    let err = CoreError::AgentExecutionFailure {
                        agent_id: owner.clone(),
                        stage: stage.name.clone(),
                        message: output
                            .error
                            .unwrap_or_else(|| "quality gate failed".to_string()),
                    };
                    match self.register_attempt_failure(tree, stage, err).await {
                        AttemptFlow::Retry => continue,
                        AttemptFlow::Escalated => return NodeFlow::Escalated,
                    }
                }
                Err(Flow::Stopped) => {
                    self.fail_node_cancelled(tree);
                    return NodeFlow::Stopped;
                }
                Err(Flow::Continue) => {
                    // Execution timed out.
                    self.deps.router.record_outcome(&owner, false);
                    let err = CoreError::AgentExecutionFailure {
                        agent_id: owner.clone(),
                        stage: stage.name.clone(),
                        message: "execution timed out".to_string(),
                    };
                    match self.register_attempt_failure(tree, stage, err).await {
                        AttemptFlow::Retry => continue,
                        AttemptFlow::Escalated => return NodeFlow::Escalated,
                    }
                }
            }
        }
    }

    /// Publish the execution order and bounded-wait on the per-task result
    /// signal, staying responsive to session commands. `Err(Stopped)` means
    /// the session was stopped mid-flight; `Err(Continue)` means timeout.
    async fn dispatch_and_await(
        &mut self,
        stage: &StageDescriptor,
        tree: &mut TaskTree,
        node_id: &str,
        owner: &str,
    ) -> Result<StageOutput, Flow> {
        // Subscribe before publishing the order so the result cannot race us.
        let mut results = self.deps.bus.subscribe(&topics::exec_result(node_id));

        if let Some(node) = tree.current_mut() {
            if let Err(e) = node.transition(NodeStatus::Running) {
                tracing::error!(error = %e, "node run transition rejected");
                return Err(Flow::Stopped);
            }
        }
        self.set_status(|s| s.node_status = Some(NodeStatus::Running));

        let order = ExecutionOrder {
            task_id: node_id.to_string(),
            session_id: self.session.session_id.clone(),
            stage_name: stage.name.clone(),
            agent_id: owner.to_string(),
            context_snapshot_ref: Some(self.context_ref.clone()),
        };
        self.deps
            .bus
            .publish_json(&topics::exec_order(owner), "orchestrator", &order);

        let deadline = tokio::time::sleep(self.deps.config.execution_timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Err(Flow::Continue),
                cmd = self.command_rx.recv() => match cmd {
                    Some(SessionCommand::Stop) | None => {
                        // Best effort: stop awaiting and cancel the task's
                        // transaction topic. A busy agent cannot be halted.
                        self.deps.bus.publish(
                            &topics::a2a_cancel(node_id),
                            &self.session.session_id,
                            json!({ "reason": "session stopped" }),
                        );
                        return Err(Flow::Stopped);
                    }
                    Some(SessionCommand::Pause) => self.pending_pause = true,
                    Some(SessionCommand::Resume) => self.pending_pause = false,
                },
                ev = results.recv() => {
                    let Some(ev) = ev else { return Err(Flow::Continue) };
                    let Ok(output) = serde_json::from_value::<StageOutput>(ev.payload) else {
                        continue;
                    };
                    if output.task_id != node_id {
                        continue;
                    }
                    return Ok(output);
                }
            }
        }
    }

    /// Quality gate passed: close out the node and advance the chain
    async fn complete_node(
        &mut self,
        stage: &StageDescriptor,
        tree: &mut TaskTree,
        node_id: &str,
        output: StageOutput,
    ) -> NodeFlow {
        if let Some(node) = tree.current_mut() {
            if let Err(e) = node.transition(NodeStatus::Succeeded) {
                tracing::error!(error = %e, "node completion transition rejected");
                return NodeFlow::Stopped;
            }
        }

        // The stage output becomes the context snapshot the next stage
        // (and any handoff) starts from.
        let next_ref = format!("ctx-{}-{}", self.session.session_id, stage.name);
        if let Err(e) = self.deps.memory.store(&next_ref, output.output.clone()).await {
            tracing::warn!(error = %e, "failed to store stage snapshot");
        } else {
            self.context_ref = next_ref;
        }

        self.deps.bus.publish(
            topics::NODE_COMPLETED,
            &self.session.session_id,
            json!({
                "node_id": node_id,
                "stage": stage.name,
                "agent_id": output.agent_id,
            }),
        );
        self.set_status(|s| {
            s.node_status = Some(NodeStatus::Succeeded);
            s.attempt_count = 0;
        });

        if let Err(e) = tree.advance() {
            tracing::error!(error = %e, "chain advance rejected");
            return NodeFlow::Stopped;
        }
        NodeFlow::Advanced
    }

    /// Record one failed attempt; retry the same stage while attempts
    /// remain, otherwise escalate the node
    async fn register_attempt_failure(
        &mut self,
        tree: &mut TaskTree,
        stage: &StageDescriptor,
        err: CoreError,
    ) -> AttemptFlow {
        let attempts = match tree.current_mut() {
            Some(node) => {
                node.attempt_count += 1;
                node.attempt_count
            }
            None => return AttemptFlow::Escalated,
        };
        let message = format!("{err} (stage {}, attempt {attempts})", stage.name);
        tracing::warn!(stage = %stage.name, attempts, error = %err, "stage attempt failed");
        self.set_status(move |s| {
            s.attempt_count = attempts;
            s.last_error = Some(message);
        });

        if attempts < stage.retry.max_attempts {
            if let Some(node) = tree.current_mut() {
                if let Err(e) = node.transition(NodeStatus::Retrying) {
                    tracing::error!(error = %e, "retry transition rejected");
                    return AttemptFlow::Escalated;
                }
            }
            self.deps.bus.publish(
                topics::NODE_RETRYING,
                &self.session.session_id,
                json!({ "stage": stage.name, "attempt": attempts }),
            );
            tokio::time::sleep(Duration::from_millis(stage.retry.backoff_ms)).await;
            AttemptFlow::Retry
        } else {
            self.escalate_node(tree, stage, err)
        }
    }

    /// Move the current node to ESCALATED and emit the escalation event
    /// exactly once. The session itself stays active.
    fn escalate_node(
        &mut self,
        tree: &mut TaskTree,
        stage: &StageDescriptor,
        err: CoreError,
    ) -> AttemptFlow {
        let (node_id, attempts) = match tree.current_mut() {
            Some(node) => {
                if let Err(e) = node.transition(NodeStatus::Escalated) {
                    tracing::error!(error = %e, "escalation transition rejected");
                }
                (node.node_id.clone(), node.attempt_count)
            }
            None => return AttemptFlow::Escalated,
        };

        self.deps.bus.publish(
            topics::NODE_ESCALATED,
            &self.session.session_id,
            json!({
                "node_id": node_id,
                "stage": stage.name,
                "attempts": attempts,
                "error": err.kind(),
            }),
        );
        let message = format!("{err} (stage {}, attempts {attempts})", stage.name);
        self.set_status(move |s| {
            s.node_status = Some(NodeStatus::Escalated);
            s.last_error = Some(message);
        });
        AttemptFlow::Escalated
    }

    fn fail_node_cancelled(&mut self, tree: &mut TaskTree) {
        if let Some(node) = tree.current_mut() {
            if !node.status.is_terminal() {
                if let Err(e) = node.transition(NodeStatus::Failed) {
                    tracing::error!(error = %e, "cancel transition rejected");
                }
            }
        }
        self.set_status(|s| {
            s.node_status = Some(NodeStatus::Failed);
            s.last_error = Some("cancelled (session stopped)".to_string());
        });
    }

    /// Drain queued commands without blocking
    fn drain_commands(&mut self) -> Flow {
        while let Ok(cmd) = self.command_rx.try_recv() {
            match cmd {
                SessionCommand::Pause => self.pending_pause = true,
                SessionCommand::Resume => self.pending_pause = false,
                SessionCommand::Stop => return Flow::Stopped,
            }
        }
        Flow::Continue
    }

    /// Paused: no new admissions until resumed or stopped
    async fn wait_while_paused(&mut self) -> Flow {
        self.session.state = SessionState::Paused;
        self.set_status(|s| s.state = SessionState::Paused);
        self.deps.bus.publish(
            topics::SESSION_PAUSED,
            &self.session.session_id,
            json!({ "session_id": self.session.session_id }),
        );

        loop {
            match self.command_rx.recv().await {
                Some(SessionCommand::Resume) => {
                    self.pending_pause = false;
                    self.session.state = SessionState::Active;
                    self.set_status(|s| s.state = SessionState::Active);
                    self.deps.bus.publish(
                        topics::SESSION_RESUMED,
                        &self.session.session_id,
                        json!({ "session_id": self.session.session_id }),
                    );
                    return Flow::Continue;
                }
                Some(SessionCommand::Pause) => continue,
                Some(SessionCommand::Stop) | None => return Flow::Stopped,
            }
        }
    }

    /// Escalated node: hold the session open until it is stopped
    async fn park(&mut self) -> Flow {
        loop {
            match self.command_rx.recv().await {
                Some(SessionCommand::Stop) | None => return Flow::Stopped,
                Some(_) => continue,
            }
        }
    }

    /// Wait out a backoff while staying responsive to commands
    async fn sleep_or_command(&mut self, duration: Duration) -> Flow {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Flow::Continue,
                cmd = self.command_rx.recv() => match cmd {
                    Some(SessionCommand::Pause) => self.pending_pause = true,
                    Some(SessionCommand::Resume) => self.pending_pause = false,
                    Some(SessionCommand::Stop) | None => return Flow::Stopped,
                },
            }
        }
    }

    fn finish(mut self, outcome: Outcome, tree: &TaskTree) {
        let (state, topic) = match outcome {
            Outcome::Completed => (SessionState::Completed, topics::SESSION_COMPLETED),
            Outcome::Stopped => (SessionState::Stopped, topics::SESSION_STOPPED),
        };
        self.session.state = state;
        self.set_status(move |s| s.state = state);
        self.deps.bus.publish(
            topic,
            &self.session.session_id,
            json!({ "session_id": self.session.session_id }),
        );
        self.archive(tree);
    }

    fn archive(&self, tree: &TaskTree) {
        let Some(db) = &self.deps.db else { return };
        let status = self.status_tx.borrow().clone();
        let record = SessionRecord {
            session_id: self.session.session_id.clone(),
            goal: self.session.goal.clone(),
            tier: self.session.tier.clone(),
            state: self.session.state,
            current_stage: status.current_stage,
            attempt_count: status.attempt_count,
            last_error: status.last_error,
            created_at: self.session.created_at,
            closed_at: chrono::Utc::now(),
        };
        if let Err(e) = SessionArchive::new(db).save(&record) {
            tracing::warn!(error = %e, "failed to archive session");
        }
        tracing::debug!(
            nodes = tree.nodes().len(),
            state = self.session.state.as_str(),
            "session archived"
        );
    }

    fn set_status(&self, f: impl FnOnce(&mut SessionStatus)) {
        self.status_tx.send_modify(f);
    }
}

fn flow_from_attempt(flow: AttemptFlow) -> NodeFlow {
    match flow {
        AttemptFlow::Retry => NodeFlow::Advanced,
        AttemptFlow::Escalated => NodeFlow::Escalated,
    }
}
