//! # A2A Mediator
//!
//! The handshake + handoff state machine between a producing agent and a
//! consuming agent. One transaction per handoff:
//!
//! ```text
//! IDLE → HANDSHAKE_SENT → HANDSHAKE_ACKED → HANDOFF_IN_PROGRESS → {COMPLETED | FAILED}
//! ```
//!
//! The mediator guarantees delivery, not content fidelity: it fails the
//! transaction if the responder cannot acknowledge or dereference the
//! context snapshot within the deadline. Every transaction reaches exactly
//! one terminal outcome; the transition guard rejects double completion.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::{AgentDescriptor, CapabilityTag};
use crate::bus::{topics, EventBus, Subscription};
use crate::error::CoreError;
use crate::router::MoeRouter;

/// Protocol version carried in every handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Mediator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Per-attempt deadline covering the whole transaction, handshake
    /// publish through transfer confirm
    pub deadline_ms: u64,
    /// Additional candidates tried after the first attempt fails
    pub max_retries: u32,
    /// Protocol version stamped on requests
    pub protocol_version: u32,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 1_000,
            max_retries: 2,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl HandoffConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Handshake request, owned by the initiating transaction until
/// acknowledged or timed out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub task_id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub protocol_version: u32,
    pub capabilities_required: BTreeSet<CapabilityTag>,
    pub context_snapshot_ref: String,
    pub deadline_ms: u64,
}

/// Responder's answer to a handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub task_id: String,
    pub agent_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

/// Context snapshot transfer, published after the handshake is acked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEnvelope {
    pub task_id: String,
    pub to_agent_id: String,
    pub context_snapshot_ref: String,
}

/// Responder's receipt for the transferred snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfirm {
    pub task_id: String,
    pub agent_id: String,
    pub received: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Terminal failure reasons for a handoff transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffFailure {
    Timeout,
    Rejected,
    SnapshotUnavailable,
    Cancelled,
}

/// State of one handoff transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffState {
    Idle,
    HandshakeSent,
    HandshakeAcked,
    HandoffInProgress,
    Completed,
    Failed(HandoffFailure),
}

impl HandoffState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Transition-guarded transaction record
#[derive(Debug)]
pub struct HandoffTransaction {
    task_id: String,
    state: HandoffState,
}

impl HandoffTransaction {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: HandoffState::Idle,
        }
    }

    pub fn state(&self) -> &HandoffState {
        &self.state
    }

    /// Move to `next`, rejecting illegal moves and double completion
    pub fn advance(&mut self, next: HandoffState) -> Result<(), CoreError> {
        use HandoffState::*;
        let allowed = matches!(
            (&self.state, &next),
            (Idle, HandshakeSent)
                | (HandshakeSent, HandshakeAcked)
                | (HandshakeAcked, HandoffInProgress)
                | (HandoffInProgress, Completed)
                | (HandshakeSent, Failed(_))
                | (HandshakeAcked, Failed(_))
                | (HandoffInProgress, Failed(_))
        );
        if !allowed {
            return Err(CoreError::InvalidTransition(format!(
                "handoff {}: {:?} -> {:?}",
                self.task_id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Receipt returned to the orchestrator once an agent confirms ownership
#[derive(Debug, Clone)]
pub struct HandoffReceipt {
    pub task_id: String,
    pub owner_agent_id: String,
    pub attempts: u32,
}

/// Drives handoff transactions over the event bus
pub struct Mediator {
    bus: Arc<EventBus>,
    config: HandoffConfig,
}

impl Mediator {
    pub fn new(bus: Arc<EventBus>, config: HandoffConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// Negotiate ownership transfer of a task node to the best available
    /// agent. Retries the handshake against the router's next candidate
    /// (never the same agent twice) up to `max_retries` before surfacing
    /// the failure. Agents already in `excluded` are never contacted, and
    /// every candidate that fails an attempt is added to it, so the caller's
    /// view of unusable agents stays in sync across stage retries.
    pub async fn negotiate(
        &self,
        task_id: &str,
        from_agent_id: &str,
        stage_name: &str,
        required: &BTreeSet<CapabilityTag>,
        snapshot_ref: &str,
        router: &MoeRouter,
        tier: &str,
        excluded: &mut BTreeSet<String>,
    ) -> Result<HandoffReceipt, CoreError> {
        let mut candidates_seen = excluded.clone();
        candidates_seen.insert(from_agent_id.to_string());
        let mut last_err: Option<CoreError> = None;

        // One subscription for the whole negotiation: a cancel published
        // between attempts is buffered and picked up by the next one.
        let mut cancels = self.bus.subscribe(&topics::a2a_cancel(task_id));

        for attempt in 1..=self.config.max_retries + 1 {
            let Some(candidate) =
                router.select_agent(stage_name, required, tier, &candidates_seen)
            else {
                break;
            };

            match self
                .attempt(task_id, from_agent_id, &candidate, required, snapshot_ref, &mut cancels)
                .await
            {
                Ok(()) => {
                    self.bus.publish(
                        topics::HANDOFF_COMPLETED,
                        "mediator",
                        serde_json::json!({
                            "task_id": task_id,
                            "owner": candidate.agent_id,
                            "attempts": attempt,
                        }),
                    );
                    return Ok(HandoffReceipt {
                        task_id: task_id.to_string(),
                        owner_agent_id: candidate.agent_id,
                        attempts: attempt,
                    });
                }
                Err(CoreError::Cancelled) => {
                    self.publish_failed(task_id, "cancelled");
                    return Err(CoreError::Cancelled);
                }
                Err(e) => {
                    tracing::warn!(
                        task_id,
                        agent_id = %candidate.agent_id,
                        error = %e,
                        "handoff attempt failed, trying next candidate"
                    );
                    candidates_seen.insert(candidate.agent_id.clone());
                    excluded.insert(candidate.agent_id);
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or(CoreError::NoAgentAvailable {
            stage: stage_name.to_string(),
        });
        self.publish_failed(task_id, err.kind());
        Err(err)
    }

    /// One transaction against one candidate, bounded by a single deadline
    /// from handshake publish through transfer confirm
    async fn attempt(
        &self,
        task_id: &str,
        from_agent_id: &str,
        candidate: &AgentDescriptor,
        required: &BTreeSet<CapabilityTag>,
        snapshot_ref: &str,
        cancels: &mut Subscription,
    ) -> Result<(), CoreError> {
        // Subscribe before publishing so the responder's answers cannot race
        // past us.
        let mut responses = self.bus.subscribe(&topics::a2a_response(task_id));
        let mut confirms = self.bus.subscribe(&topics::a2a_confirm(task_id));

        let mut txn = HandoffTransaction::new(task_id);
        txn.advance(HandoffState::HandshakeSent)?;

        let deadline = tokio::time::sleep(self.config.deadline());
        tokio::pin!(deadline);

        let request = HandshakeRequest {
            task_id: task_id.to_string(),
            from_agent_id: from_agent_id.to_string(),
            to_agent_id: candidate.agent_id.clone(),
            protocol_version: self.config.protocol_version,
            capabilities_required: required.clone(),
            context_snapshot_ref: snapshot_ref.to_string(),
            deadline_ms: self.config.deadline_ms,
        };
        self.bus
            .publish_json(&topics::a2a_handshake(&candidate.agent_id), "mediator", &request);

        // Phase 1: await the handshake ack.
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    txn.advance(HandoffState::Failed(HandoffFailure::Timeout))?;
                    return Err(CoreError::HandshakeTimeout {
                        agent_id: candidate.agent_id.clone(),
                        deadline_ms: self.config.deadline_ms,
                    });
                }
                ev = cancels.recv() => {
                    if ev.is_some() {
                        txn.advance(HandoffState::Failed(HandoffFailure::Cancelled))?;
                        return Err(CoreError::Cancelled);
                    }
                    // Bus went away; no ack can arrive either.
                    txn.advance(HandoffState::Failed(HandoffFailure::Timeout))?;
                    return Err(CoreError::HandshakeTimeout {
                        agent_id: candidate.agent_id.clone(),
                        deadline_ms: self.config.deadline_ms,
                    });
                }
                ev = responses.recv() => {
                    let Some(ev) = ev else {
                        txn.advance(HandoffState::Failed(HandoffFailure::Timeout))?;
                        return Err(CoreError::HandshakeTimeout {
                            agent_id: candidate.agent_id.clone(),
                            deadline_ms: self.config.deadline_ms,
                        });
                    };
                    let Ok(response) = serde_json::from_value::<HandshakeResponse>(ev.payload) else {
                        continue;
                    };
                    if response.task_id != task_id || response.agent_id != candidate.agent_id {
                        continue;
                    }
                    if response.accepted {
                        txn.advance(HandoffState::HandshakeAcked)?;
                        break;
                    }
                    txn.advance(HandoffState::Failed(HandoffFailure::Rejected))?;
                    return Err(CoreError::CapabilityMismatch {
                        agent_id: candidate.agent_id.clone(),
                        reason: response
                            .reject_reason
                            .unwrap_or_else(|| "handshake rejected".to_string()),
                    });
                }
            }
        }

        // Phase 2: transfer the context snapshot reference. From here the
        // initiating agent must not emit further results for this node.
        txn.advance(HandoffState::HandoffInProgress)?;
        let envelope = TransferEnvelope {
            task_id: task_id.to_string(),
            to_agent_id: candidate.agent_id.clone(),
            context_snapshot_ref: snapshot_ref.to_string(),
        };
        self.bus
            .publish_json(&topics::a2a_transfer(task_id), "mediator", &envelope);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    txn.advance(HandoffState::Failed(HandoffFailure::SnapshotUnavailable))?;
                    return Err(CoreError::SnapshotUnavailable {
                        snapshot_ref: snapshot_ref.to_string(),
                    });
                }
                ev = cancels.recv() => {
                    if ev.is_some() {
                        txn.advance(HandoffState::Failed(HandoffFailure::Cancelled))?;
                        return Err(CoreError::Cancelled);
                    }
                    txn.advance(HandoffState::Failed(HandoffFailure::SnapshotUnavailable))?;
                    return Err(CoreError::SnapshotUnavailable {
                        snapshot_ref: snapshot_ref.to_string(),
                    });
                }
                ev = confirms.recv() => {
                    let Some(ev) = ev else {
                        txn.advance(HandoffState::Failed(HandoffFailure::SnapshotUnavailable))?;
                        return Err(CoreError::SnapshotUnavailable {
                            snapshot_ref: snapshot_ref.to_string(),
                        });
                    };
                    let Ok(confirm) = serde_json::from_value::<TransferConfirm>(ev.payload) else {
                        continue;
                    };
                    if confirm.task_id != task_id || confirm.agent_id != candidate.agent_id {
                        continue;
                    }
                    if confirm.received {
                        txn.advance(HandoffState::Completed)?;
                        return Ok(());
                    }
                    txn.advance(HandoffState::Failed(HandoffFailure::SnapshotUnavailable))?;
                    return Err(CoreError::SnapshotUnavailable {
                        snapshot_ref: snapshot_ref.to_string(),
                    });
                }
            }
        }
    }

    fn publish_failed(&self, task_id: &str, reason: &str) {
        self.bus.publish(
            topics::HANDOFF_FAILED,
            "mediator",
            serde_json::json!({ "task_id": task_id, "reason": reason }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn caps(tags: &[&str]) -> BTreeSet<CapabilityTag> {
        tags.iter().map(|t| CapabilityTag::from(*t)).collect()
    }

    /// Minimal responder: ack (or reject) handshakes addressed to
    /// `agent_id`, then confirm the transfer.
    fn spawn_responder(bus: Arc<EventBus>, agent_id: &str, accept: bool) {
        let agent_id = agent_id.to_string();
        let mut handshakes = bus.subscribe(&topics::a2a_handshake(&agent_id));
        tokio::spawn(async move {
            while let Some(ev) = handshakes.recv().await {
                let req: HandshakeRequest = match serde_json::from_value(ev.payload) {
                    Ok(req) => req,
                    Err(_) => continue,
                };
                bus.publish_json(
                    &topics::a2a_response(&req.task_id),
                    &agent_id,
                    &HandshakeResponse {
                        task_id: req.task_id.clone(),
                        agent_id: agent_id.clone(),
                        accepted: accept,
                        reject_reason: (!accept).then(|| "missing capability".to_string()),
                    },
                );
                if !accept {
                    continue;
                }
                let mut transfers = bus.subscribe(&topics::a2a_transfer(&req.task_id));
                if let Some(_transfer) = transfers.recv().await {
                    bus.publish_json(
                        &topics::a2a_confirm(&req.task_id),
                        &agent_id,
                        &TransferConfirm {
                            task_id: req.task_id,
                            agent_id: agent_id.clone(),
                            received: true,
                            error: None,
                        },
                    );
                }
            }
        });
    }

    fn router_with(ids: &[&str]) -> MoeRouter {
        let router = MoeRouter::new();
        for id in ids {
            router.register(AgentDescriptor::new(*id).with_capabilities(["test"]));
        }
        router
    }

    fn mediator(bus: &Arc<EventBus>, deadline_ms: u64, max_retries: u32) -> Mediator {
        Mediator::new(
            Arc::clone(bus),
            HandoffConfig {
                deadline_ms,
                max_retries,
                protocol_version: PROTOCOL_VERSION,
            },
        )
    }

    #[test]
    fn test_transaction_has_single_terminal_outcome() {
        let mut txn = HandoffTransaction::new("t1");
        txn.advance(HandoffState::HandshakeSent).unwrap();
        txn.advance(HandoffState::HandshakeAcked).unwrap();
        txn.advance(HandoffState::HandoffInProgress).unwrap();
        txn.advance(HandoffState::Completed).unwrap();
        assert!(txn
            .advance(HandoffState::Failed(HandoffFailure::Timeout))
            .is_err());
        assert_eq!(txn.state(), &HandoffState::Completed);
    }

    #[test]
    fn test_no_stage_skip_in_transaction() {
        let mut txn = HandoffTransaction::new("t1");
        assert!(txn.advance(HandoffState::HandoffInProgress).is_err());
        assert_eq!(txn.state(), &HandoffState::Idle);
    }

    #[tokio::test]
    async fn test_happy_path_handoff() {
        let bus = Arc::new(EventBus::new());
        let router = router_with(&["a", "b"]);
        spawn_responder(Arc::clone(&bus), "a", true);

        let receipt = mediator(&bus, 500, 1)
            .negotiate(
                "n1",
                "origin",
                "test",
                &caps(&["test"]),
                "ctx-1",
                &router,
                "free",
                &mut BTreeSet::new(),
            )
            .await
            .expect("handoff");
        assert_eq!(receipt.owner_agent_id, "a");
        assert_eq!(receipt.attempts, 1);
    }

    #[tokio::test]
    async fn test_timeout_retries_next_candidate() {
        let bus = Arc::new(EventBus::new());
        let router = router_with(&["silent", "alive"]);
        // "silent" never answers; "alive" does.
        spawn_responder(Arc::clone(&bus), "alive", true);

        let receipt = mediator(&bus, 50, 1)
            .negotiate(
                "n1",
                "origin",
                "test",
                &caps(&["test"]),
                "ctx-1",
                &router,
                "free",
                &mut BTreeSet::new(),
            )
            .await
            .expect("second candidate should win");
        assert_eq!(receipt.owner_agent_id, "alive");
        assert_eq!(receipt.attempts, 2);
    }

    #[tokio::test]
    async fn test_rejection_moves_to_next_candidate() {
        let bus = Arc::new(EventBus::new());
        let router = router_with(&["picky", "open"]);
        spawn_responder(Arc::clone(&bus), "picky", false);
        spawn_responder(Arc::clone(&bus), "open", true);

        let receipt = mediator(&bus, 500, 1)
            .negotiate(
                "n1",
                "origin",
                "test",
                &caps(&["test"]),
                "ctx-1",
                &router,
                "free",
                &mut BTreeSet::new(),
            )
            .await
            .expect("handoff");
        assert_eq!(receipt.owner_agent_id, "open");
    }

    #[tokio::test]
    async fn test_unanswered_handshake_terminates_within_bound() {
        let bus = Arc::new(EventBus::new());
        let router = router_with(&["ghost-1", "ghost-2"]);

        let started = Instant::now();
        let err = mediator(&bus, 50, 1)
            .negotiate(
                "n1",
                "origin",
                "test",
                &caps(&["test"]),
                "ctx-1",
                &router,
                "free",
                &mut BTreeSet::new(),
            )
            .await
            .expect_err("no responder");
        assert!(matches!(err, CoreError::HandshakeTimeout { .. }));
        // deadline x (1 + max_retries) plus scheduling slack
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_cancel_resolves_to_failed_cancelled() {
        let bus = Arc::new(EventBus::new());
        let router = router_with(&["ghost"]);

        let cancel_bus = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_bus.publish(&topics::a2a_cancel("n1"), "orchestrator", json!({}));
        });

        let started = Instant::now();
        let err = mediator(&bus, 5_000, 0)
            .negotiate(
                "n1",
                "origin",
                "test",
                &caps(&["test"]),
                "ctx-1",
                &router,
                "free",
                &mut BTreeSet::new(),
            )
            .await
            .expect_err("cancelled");
        assert!(matches!(err, CoreError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_excluded_agents_are_never_contacted() {
        let bus = Arc::new(EventBus::new());
        let router = router_with(&["picky", "open"]);
        spawn_responder(Arc::clone(&bus), "picky", false);
        spawn_responder(Arc::clone(&bus), "open", true);

        // A candidate the caller already ruled out must not see a handshake.
        let mut picky_handshakes = bus.subscribe(&topics::a2a_handshake("picky"));
        let mut excluded: BTreeSet<String> = ["picky".to_string()].into();

        let receipt = mediator(&bus, 500, 1)
            .negotiate(
                "n1",
                "origin",
                "test",
                &caps(&["test"]),
                "ctx-1",
                &router,
                "free",
                &mut excluded,
            )
            .await
            .expect("handoff");
        assert_eq!(receipt.owner_agent_id, "open");
        assert_eq!(receipt.attempts, 1);
        assert!(picky_handshakes.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_failed_candidates_are_reported_back() {
        let bus = Arc::new(EventBus::new());
        let router = router_with(&["picky", "open"]);
        spawn_responder(Arc::clone(&bus), "picky", false);
        spawn_responder(Arc::clone(&bus), "open", true);

        let mut excluded = BTreeSet::new();
        mediator(&bus, 500, 1)
            .negotiate(
                "n1",
                "origin",
                "test",
                &caps(&["test"]),
                "ctx-1",
                &router,
                "free",
                &mut excluded,
            )
            .await
            .expect("handoff");

        // The rejecting agent lands in the caller's exclusion set so a later
        // negotiation for the same node never contacts it again.
        assert!(excluded.contains("picky"));
        assert!(!excluded.contains("open"));
    }

    #[tokio::test]
    async fn test_one_deadline_spans_ack_and_confirm() {
        let bus = Arc::new(EventBus::new());
        let router = router_with(&["laggard"]);

        // Responder burns most of the deadline before acking and never
        // confirms the transfer; the attempt must still end at one deadline,
        // not one per phase.
        let agent_bus = Arc::clone(&bus);
        let mut handshakes = bus.subscribe(&topics::a2a_handshake("laggard"));
        tokio::spawn(async move {
            while let Some(ev) = handshakes.recv().await {
                let req: HandshakeRequest = match serde_json::from_value(ev.payload) {
                    Ok(req) => req,
                    Err(_) => continue,
                };
                tokio::time::sleep(Duration::from_millis(80)).await;
                agent_bus.publish_json(
                    &topics::a2a_response(&req.task_id),
                    "laggard",
                    &HandshakeResponse {
                        task_id: req.task_id,
                        agent_id: "laggard".to_string(),
                        accepted: true,
                        reject_reason: None,
                    },
                );
            }
        });

        let started = Instant::now();
        let err = mediator(&bus, 100, 0)
            .negotiate(
                "n1",
                "origin",
                "test",
                &caps(&["test"]),
                "ctx-1",
                &router,
                "free",
                &mut BTreeSet::new(),
            )
            .await
            .expect_err("confirm never arrives");
        assert!(matches!(err, CoreError::SnapshotUnavailable { .. }));
        assert!(started.elapsed() < Duration::from_millis(160));
    }
}
