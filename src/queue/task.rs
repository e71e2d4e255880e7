use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    /// Dequeue ordering rank; lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Self::High),
            1 => Some(Self::Medium),
            2 => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to do next, produced by a decision engine. Immutable once built;
/// persisted only embedded in a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TaskDecision {
    /// Natural-language instruction handed to the agent.
    pub task: String,
    /// Id of the agent capability that should run it.
    pub agent: String,
    pub priority: TaskPriority,
    /// Expected wall-clock duration, seconds. Basis of the session budget.
    pub estimated_duration_sec: u64,
    /// Why this task was chosen; always cites a concrete context fact.
    pub rationale: String,
    /// Only set by the generative backend, in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl TaskDecision {
    pub fn new(
        task: impl Into<String>,
        agent: impl Into<String>,
        priority: TaskPriority,
        estimated_duration_sec: u64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            task: task.into(),
            agent: agent.into(),
            priority,
            estimated_duration_sec,
            rationale: rationale.into(),
            confidence: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(self.estimated_duration_sec)
    }

    /// Stable dedup hash over the semantic fields (task, agent, priority).
    /// Metadata and rationale do not participate: two decisions for the same
    /// work hash identically even when explained differently.
    pub fn op_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.task.as_bytes());
        hasher.update([0]);
        hasher.update(self.agent.as_bytes());
        hasher.update([0]);
        hasher.update(self.priority.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn allowed_transitions(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[InProgress],
            InProgress => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued unit of overnight work. Owned exclusively by the queue; all
/// mutation goes through its transition API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvernightTask {
    pub id: String,
    pub op_hash: String,
    pub status: TaskStatus,
    pub decision: TaskDecision,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OvernightTask {
    pub fn new(decision: TaskDecision) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            op_hash: decision.op_hash(),
            status: TaskStatus::Pending,
            decision,
            session_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Read-side query filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub agent: Option<String>,
    pub priority: Option<TaskPriority>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn matches(&self, task: &OvernightTask) -> bool {
        let status_ok = self.status.map_or(true, |s| task.status == s);
        let agent_ok = self
            .agent
            .as_deref()
            .map_or(true, |a| task.decision.agent == a);
        let priority_ok = self.priority.map_or(true, |p| task.decision.priority == p);
        let after_ok = self.created_after.map_or(true, |t| task.created_at >= t);
        let before_ok = self.created_before.map_or(true, |t| task.created_at < t);
        status_ok && agent_ok && priority_ok && after_ok && before_ok
    }
}

/// Tasks per status, for the status surface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision() -> TaskDecision {
        TaskDecision::new(
            "add tests for parser",
            "tester",
            TaskPriority::Medium,
            1200,
            "coverage is 0.42, below the 0.60 threshold",
        )
    }

    #[test]
    fn test_op_hash_ignores_rationale_and_metadata() {
        let a = decision();
        let mut b = decision();
        b.rationale = String::from("different explanation, same work");
        let c = decision().with_metadata("origin", "retry");
        assert_eq!(a.op_hash(), b.op_hash());
        assert_eq!(a.op_hash(), c.op_hash());
    }

    #[test]
    fn test_op_hash_distinguishes_semantic_fields() {
        let base = decision();
        let mut other_task = decision();
        other_task.task = String::from("different work");
        let mut other_agent = decision();
        other_agent.agent = String::from("implementer");
        let mut other_priority = decision();
        other_priority.priority = TaskPriority::High;
        assert_ne!(base.op_hash(), other_task.op_hash());
        assert_ne!(base.op_hash(), other_agent.op_hash());
        assert_ne!(base.op_hash(), other_priority.op_hash());
    }

    #[test]
    fn test_op_hash_separator_prevents_field_bleed() {
        let a = TaskDecision::new("ab", "c", TaskPriority::Low, 60, "r");
        let b = TaskDecision::new("a", "bc", TaskPriority::Low, 60, "r");
        assert_ne!(a.op_hash(), b.op_hash());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_priority_rank_orders_high_first() {
        assert!(TaskPriority::High.rank() < TaskPriority::Medium.rank());
        assert!(TaskPriority::Medium.rank() < TaskPriority::Low.rank());
        assert_eq!(TaskPriority::from_rank(0), Some(TaskPriority::High));
        assert_eq!(TaskPriority::from_rank(3), None);
    }

    #[test]
    fn test_new_task_starts_pending() {
        let task = OvernightTask::new(decision());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.op_hash, task.decision.op_hash());
        assert!(task.session_id.is_none());
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
    }
}
