//! # Task-Tree Orchestrator
//!
//! Decomposes a session goal into a linear chain of stage nodes, assigns
//! each node to exactly one agent, and drives the chain forward through
//! retries, escalations, and session control commands.

mod engine;
mod registry;
mod session;
mod task_tree;

pub use registry::Orchestrator;
pub use session::{Session, SessionCommand, SessionState, SessionStatus};
pub use task_tree::{NodeStatus, RetryPolicy, StageDescriptor, TaskNode, TaskTree};
