//! # Synapse Core
//!
//! Orchestration core for a multi-agent pool: a topic-based event bus,
//! an agent-to-agent handoff mediator, a task-tree orchestrator, a
//! tier-aware feature gate, and a capability router.
//!
//! ## Architecture
//!
//! - `bus/` - In-process publish/subscribe event bus with topic patterns
//! - `mediator` - Handshake/transfer/confirm protocol for task handoffs
//! - `orchestrator/` - Sessions, task trees, and the per-session engine
//! - `gate` - Tier admission policies with atomic concurrency counters
//! - `router` - Capability-specificity agent selection
//! - `memory` - Context snapshot storage (in-memory and SQLite)
//! - `state/` - Durable archive under `.synapse/synapse.db`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synapse_core::config::{default_stages, OrchestratorConfig};
//! use synapse_core::orchestrator::Orchestrator;
//!
//! let orchestrator = Orchestrator::new(config, stages, bus, router, memory);
//! let session_id = orchestrator.start_session("Build a stock tracker", "free")?;
//! ```

pub mod agents;
pub mod backend;
pub mod bus;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod mediator;
pub mod memory;
pub mod orchestrator;
pub mod router;
pub mod state;

pub use agents::{AgentDescriptor, CapabilityTag};
pub use backend::{AgentBackend, ExecutionOrder, StageOutput};
pub use bus::{Event, EventBus};
pub use error::CoreError;
pub use gate::{Admission, DenialReason, FeatureGate, TierPolicy};
pub use mediator::Mediator;
pub use memory::MemoryEngine;
pub use orchestrator::Orchestrator;
pub use router::MoeRouter;
