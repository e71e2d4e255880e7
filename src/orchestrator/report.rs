use chrono::{DateTime, Utc};
use serde::Serialize;

/// What one wake cycle did, for logs and the `once` command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
    /// Name of the engine that produced the decisions.
    pub engine: String,
    /// Decisions the engine returned.
    pub decided: usize,
    /// New queue entries created from those decisions.
    pub enqueued: usize,
    /// Decisions that collapsed onto an existing live entry.
    pub deduped: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl CycleReport {
    pub fn delegated(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// One-line form used in the event log.
    pub fn summary(&self) -> String {
        format!(
            "decided {} (new {}, dedup {}), completed {}, failed {}, cancelled {}",
            self.decided, self.enqueued, self.deduped, self.completed, self.failed, self.cancelled
        )
    }
}
