//! Public orchestration facade. Owns the shared collaborators and the map
//! of live session engines, and exposes the session control surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::bus::EventBus;
use crate::config::OrchestratorConfig;
use crate::error::CoreError;
use crate::gate::FeatureGate;
use crate::mediator::Mediator;
use crate::memory::MemoryEngine;
use crate::router::MoeRouter;
use crate::state::SynapseDb;

use super::engine::{self, EngineDeps, EngineHandle};
use super::session::{Session, SessionCommand, SessionStatus};
use super::task_tree::StageDescriptor;

pub struct Orchestrator {
    deps: EngineDeps,
    sessions: Mutex<HashMap<String, EngineHandle>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        stages: Vec<StageDescriptor>,
        bus: Arc<EventBus>,
        router: Arc<MoeRouter>,
        memory: Arc<dyn MemoryEngine>,
    ) -> Self {
        let gate = Arc::new(FeatureGate::new(config.tiers.clone()));
        let mediator = Arc::new(Mediator::new(bus.clone(), config.handoff.clone()));
        Self {
            deps: EngineDeps {
                bus,
                gate,
                router,
                mediator,
                memory,
                db: None,
                config: Arc::new(config),
                stages: Arc::new(stages),
            },
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a database for session archival
    pub fn with_db(mut self, db: Arc<SynapseDb>) -> Self {
        self.deps.db = Some(db);
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.deps.bus
    }

    pub fn gate(&self) -> &Arc<FeatureGate> {
        &self.deps.gate
    }

    pub fn router(&self) -> &Arc<MoeRouter> {
        &self.deps.router
    }

    pub fn memory(&self) -> &Arc<dyn MemoryEngine> {
        &self.deps.memory
    }

    /// Start a new session and spawn its engine. Every call creates a fresh
    /// session; there is no resumption of archived ones.
    pub fn start_session(&self, goal: &str, tier: &str) -> Result<String, CoreError> {
        if self.deps.gate.policy(tier).is_none() {
            return Err(CoreError::FeatureGateDenied {
                tier: tier.to_string(),
                reason: crate::gate::DenialReason::UnknownTier,
            });
        }

        let session = Session::new(goal, tier);
        let session_id = session.session_id.clone();
        tracing::info!(%session_id, tier, "starting session");
        let handle = engine::spawn(session, self.deps.clone());
        self.lock_sessions().insert(session_id.clone(), handle);
        Ok(session_id)
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<(), CoreError> {
        self.send_command(session_id, SessionCommand::Stop).await
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<(), CoreError> {
        self.send_command(session_id, SessionCommand::Pause).await
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<(), CoreError> {
        self.send_command(session_id, SessionCommand::Resume).await
    }

    /// Current status snapshot for a live session
    pub fn get_status(&self, session_id: &str) -> Result<SessionStatus, CoreError> {
        let sessions = self.lock_sessions();
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        let status = handle.status_rx.borrow().clone();
        Ok(status)
    }

    /// Status snapshots for every session this registry has started
    pub fn list_statuses(&self) -> Vec<SessionStatus> {
        self.lock_sessions()
            .values()
            .map(|h| h.status_rx.borrow().clone())
            .collect()
    }

    /// Terminal sessions reject control commands the same way unknown
    /// session ids do.
    async fn send_command(&self, session_id: &str, cmd: SessionCommand) -> Result<(), CoreError> {
        let tx: mpsc::Sender<SessionCommand> = {
            let sessions = self.lock_sessions();
            let handle = sessions
                .get(session_id)
                .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
            if handle.status_rx.borrow().state.is_terminal() {
                return Err(CoreError::SessionNotFound(session_id.to_string()));
            }
            handle.command_tx.clone()
        };
        tx.send(cmd)
            .await
            .map_err(|_| CoreError::SessionNotFound(session_id.to_string()))
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, EngineHandle>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // Engines hold bus subscriptions; reap them with the registry.
        for handle in self.lock_sessions().values() {
            handle.task.abort();
        }
    }
}
