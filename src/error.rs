use thiserror::Error;

#[derive(Error, Debug)]
pub enum NightshiftError {
    #[error("Configuration invalid: {0}")]
    Validation(String),

    #[error("{reason} constraint not satisfied")]
    ConstraintUnsatisfied { reason: String },

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Time budget exceeded for session {session_id} (budget: {budget_secs}s)")]
    TimeBudgetExceeded { session_id: String, budget_secs: u64 },

    #[error("Agent session error: {0}")]
    AgentSession(String),

    #[error("Decision backend error: {0}")]
    DecisionBackend(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Invalid status transition: {from} -> {to} (allowed: {allowed})")]
    InvalidTransition {
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for NightshiftError {
    fn from(err: rusqlite::Error) -> Self {
        NightshiftError::Storage(err.to_string())
    }
}

impl NightshiftError {
    /// True for failures that should abort the current cycle while the
    /// scheduler still proceeds to the next wake.
    pub fn aborts_cycle(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, NightshiftError>;
