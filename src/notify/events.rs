use serde::Serialize;

/// What happened, for event-log lines and hook payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CycleCompleted,
    CycleFailed,
    TaskCompleted,
    TaskFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CycleCompleted => "cycle_completed",
            EventKind::CycleFailed => "cycle_failed",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
        }
    }
}

/// One notification payload.
#[derive(Debug, Clone, Serialize)]
pub struct NightEvent {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
}

impl NightEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: None,
            message: message.into(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}
