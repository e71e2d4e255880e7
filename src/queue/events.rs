use serde::Serialize;

use super::task::{TaskPriority, TaskStatus};

/// Change notification published after each committed queue mutation.
///
/// Delivery is at-least-once per live subscriber and ordered per task
/// (publish order equals commit order); a lagging subscriber may drop
/// intermediate events, so consumers must treat these as hints and re-read
/// the queue for authoritative state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        task_id: String,
        op_hash: String,
        agent: String,
        priority: TaskPriority,
    },
    StatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<String>,
    },
    CleanedUp {
        removed: u64,
    },
}

impl QueueEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "queue.enqueued",
            Self::StatusChanged { .. } => "queue.status_changed",
            Self::CleanedUp { .. } => "queue.cleaned_up",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { task_id, .. } | Self::StatusChanged { task_id, .. } => Some(task_id),
            Self::CleanedUp { .. } => None,
        }
    }
}
