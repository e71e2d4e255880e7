use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{NightshiftError, Result};

/// Everything a decision engine is allowed to look at when choosing the
/// next work. Serialized verbatim into the generative backend's prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionContext {
    pub project_id: String,
    pub workspace_root: PathBuf,
    pub goals: Vec<String>,
    pub focus: Vec<String>,
    /// Agent ids that can actually be delegated to, sorted.
    pub available_agents: Vec<String>,
    /// Preferred agents in order; falls back to any available agent.
    pub agent_preferences: Vec<String>,
    /// Upper bound on decisions for this cycle.
    pub max_tasks: usize,
    pub time_budget_secs: u64,
    pub repo: RepoStatus,
    pub insights: SessionInsights,
}

impl DecisionContext {
    /// First preferred agent that is available, or the first available
    /// agent when no preference matches.
    pub fn pick_agent(&self) -> Result<&str> {
        for preferred in &self.agent_preferences {
            if self.available_agents.iter().any(|a| a == preferred) {
                return Ok(preferred);
            }
        }
        self.available_agents
            .first()
            .map(String::as_str)
            .ok_or_else(|| NightshiftError::AgentNotAvailable(String::from("no agents configured")))
    }
}

/// Snapshot of the repository taken at the start of a cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoStatus {
    pub branch: String,
    /// Uncommitted changes present in the worktree.
    pub dirty: bool,
    /// (commits ahead, commits behind) the upstream branch, when one is
    /// configured.
    pub ahead_behind: Option<(u32, u32)>,
    /// Subject lines, newest first.
    pub recent_commits: Vec<String>,
    /// (path, commits touching it) over the recent history window,
    /// most-touched first.
    pub most_touched: Vec<(String, u32)>,
    /// Rough test-to-source file ratio, when it could be computed.
    pub test_file_ratio: Option<f64>,
}

/// What recent overnight sessions tell us about where effort is needed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInsights {
    /// Task descriptions of recently failed sessions, newest first.
    pub recent_failures: Vec<String>,
    /// Task descriptions of recently completed sessions, newest first.
    pub recent_successes: Vec<String>,
    /// Estimated test coverage in [0, 1], when known.
    pub estimated_coverage: Option<f64>,
}
