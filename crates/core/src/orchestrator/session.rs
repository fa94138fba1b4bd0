//! # Sessions
//!
//! One session per submitted goal. The session object fully scopes the
//! engine's state: the task tree is owned exclusively by the engine task
//! servicing the session (single-writer discipline), and readers observe
//! it through snapshot copies published on a watch channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task_tree::NodeStatus;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Paused,
    Stopped,
    Completed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }
}

/// A session: created on goal submission, mutated only by its engine,
/// archived on completion or explicit stop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub goal: String,
    pub tier: String,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

impl Session {
    pub fn new(goal: &str, tier: &str) -> Self {
        Self {
            session_id: session_id(),
            goal: goal.to_string(),
            tier: tier.to_string(),
            created_at: Utc::now(),
            state: SessionState::Active,
        }
    }
}

/// Snapshot answer for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    /// Stage the session is currently at (or stopped/escalated at)
    pub current_stage: Option<String>,
    pub node_status: Option<NodeStatus>,
    pub attempt_count: u32,
    /// Last terminal error, with enough detail (kind + stage + attempts) to
    /// explain why a session escalated or stopped
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn initial(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: SessionState::Active,
            current_stage: None,
            node_status: None,
            attempt_count: 0,
            last_error: None,
        }
    }
}

/// Control commands sent from the registry to a session's engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Stop,
}

/// Generate a session identifier
fn session_id() -> String {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    format!("sess-{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_active() {
        let session = Session::new("build the thing", "free");
        assert_eq!(session.state, SessionState::Active);
        assert!(session.session_id.starts_with("sess-"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(!SessionState::Active.is_terminal());
        assert!(!SessionState::Paused.is_terminal());
    }
}
