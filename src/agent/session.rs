use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one delegated agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Admitted, provider not confirmed yet.
    Starting,
    /// Provider is streaming updates.
    Running,
    /// Terminal update received, result being assembled.
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn allowed_transitions(&self) -> &'static [SessionState] {
        match self {
            Self::Starting => &[Self::Running, Self::Failed, Self::Cancelled],
            Self::Running => &[Self::Completing, Self::Failed, Self::Cancelled],
            Self::Completing => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Live view of a session, as reported by `active_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub task_id: String,
    pub agent: String,
    pub task: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub budget_secs: u64,
}

/// Outcome of one finished session. `state` is always terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSessionResult {
    pub session_id: String,
    pub task_id: String,
    pub agent: String,
    pub task: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: u64,
    /// Last lines of agent output, oldest first.
    pub output_tail: Vec<String>,
    pub tool_calls: u32,
    pub budget_secs: u64,
    pub error: Option<String>,
}

impl AgentSessionResult {
    pub fn success(&self) -> bool {
        self.state == SessionState::Completed
    }
}
