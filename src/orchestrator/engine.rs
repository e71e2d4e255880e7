use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::report::CycleReport;
use crate::agent::{AgentCoordinator, AgentSessionResult, SessionState};
use crate::config::OrchestrationConfig;
use crate::decision::{DecisionContext, DecisionEngine, SessionInsights};
use crate::error::{NightshiftError, Result};
use crate::git::RepoInspector;
use crate::notify::{EventKind, NightEvent, Notifier};
use crate::queue::{OvernightTask, TaskFilter, TaskQueue, TaskStatus};
use crate::scheduler::WakeHandler;

/// Session results remembered for the next cycle's insights.
const RECENT_RESULTS: usize = 32;

/// Recent failures/successes surfaced to the decision engine.
const INSIGHT_ITEMS: usize = 5;

/// Runs the standard wake cycle: build context, decide, enqueue with
/// dedup, drain the pending queue through the coordinator, and write every
/// outcome back. Storage errors abort the cycle; everything else is
/// recorded on the task it belongs to.
pub struct Orchestrator {
    config: OrchestrationConfig,
    queue: Arc<TaskQueue>,
    coordinator: Arc<AgentCoordinator>,
    engine: Arc<dyn DecisionEngine>,
    inspector: RepoInspector,
    notifier: Notifier,
    recent: Mutex<VecDeque<AgentSessionResult>>,
    last_report: Mutex<Option<CycleReport>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestrationConfig,
        queue: Arc<TaskQueue>,
        coordinator: Arc<AgentCoordinator>,
        engine: Arc<dyn DecisionEngine>,
    ) -> Self {
        let inspector = RepoInspector::new(config.workspace());
        let notifier = Notifier::new(config.notify.clone(), Some(config.state_dir()));
        Self {
            config,
            queue,
            coordinator,
            engine,
            inspector,
            notifier,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_RESULTS)),
            last_report: Mutex::new(None),
        }
    }

    /// Replace the notifier; tests run silent.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.lock().clone()
    }

    /// Terminal results of recent sessions, newest first.
    pub fn recent_results(&self) -> Vec<AgentSessionResult> {
        self.recent.lock().iter().rev().cloned().collect()
    }

    /// Snapshot everything a decision engine may look at.
    pub async fn build_context(&self) -> Result<DecisionContext> {
        let repo = self.inspector.survey().await;
        let insights = self.build_insights().await?;
        Ok(DecisionContext {
            project_id: self.config.id.clone(),
            workspace_root: self.config.workspace(),
            goals: self.config.goals.clone(),
            focus: self.config.focus.clone(),
            available_agents: self.coordinator.available_agents(),
            agent_preferences: self.config.agent_preferences.clone(),
            max_tasks: self.config.max_concurrent,
            time_budget_secs: self.config.time_budget_sec,
            repo,
            insights,
        })
    }

    /// Recent failures and successes, in-memory ring first so the freshest
    /// session outcomes win, then the durable queue so a restart does not
    /// blank the history.
    async fn build_insights(&self) -> Result<SessionInsights> {
        let mut failures: Vec<String> = Vec::new();
        let mut successes: Vec<String> = Vec::new();

        for result in self.recent.lock().iter().rev() {
            let bucket = if result.success() {
                &mut successes
            } else {
                &mut failures
            };
            if !bucket.contains(&result.task) {
                bucket.push(result.task.clone());
            }
        }

        for (status, bucket) in [
            (TaskStatus::Failed, &mut failures),
            (TaskStatus::Completed, &mut successes),
        ] {
            let tasks = self
                .queue
                .all(TaskFilter::default().with_status(status))
                .await?;
            for task in tasks {
                if bucket.len() >= INSIGHT_ITEMS {
                    break;
                }
                if !bucket.contains(&task.decision.task) {
                    bucket.push(task.decision.task.clone());
                }
            }
        }

        failures.truncate(INSIGHT_ITEMS);
        successes.truncate(INSIGHT_ITEMS);
        Ok(SessionInsights {
            recent_failures: failures,
            recent_successes: successes,
            estimated_coverage: None,
        })
    }

    /// One full decide → enqueue → delegate cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started_at = Utc::now();
        let context = self.build_context().await?;
        let decisions = self.engine.decide(&context).await?;
        info!(
            engine = self.engine.name(),
            decided = decisions.len(),
            "decision engine returned"
        );

        let mut report = CycleReport {
            started_at: Some(started_at),
            engine: self.engine.name().to_string(),
            decided: decisions.len(),
            ..CycleReport::default()
        };

        for decision in decisions {
            let rationale = decision.rationale.clone();
            let (task_id, created) = self.queue.enqueue(decision).await?;
            if created {
                report.enqueued += 1;
                info!(task_id = %task_id, rationale = %rationale, "task enqueued");
            } else {
                report.deduped += 1;
                debug!(task_id = %task_id, "decision deduplicated onto live task");
            }
        }

        let mut batch: Vec<OvernightTask> = Vec::new();
        while let Some(task) = self.queue.dequeue().await? {
            batch.push(task);
        }

        // The coordinator's semaphore keeps this within max_concurrent.
        let outcomes = join_all(batch.iter().map(|task| self.delegate(task))).await;
        for outcome in outcomes {
            match outcome? {
                TaskStatus::Completed => report.completed += 1,
                TaskStatus::Cancelled => report.cancelled += 1,
                _ => report.failed += 1,
            }
        }

        report.duration_secs = (Utc::now() - started_at).num_seconds().max(0) as u64;
        info!(summary = %report.summary(), "cycle finished");
        let kind = if report.failed == 0 {
            EventKind::CycleCompleted
        } else {
            EventKind::CycleFailed
        };
        self.notifier
            .emit(&NightEvent::new(kind, report.summary()))
            .await;

        *self.last_report.lock() = Some(report.clone());
        Ok(report)
    }

    /// Run one dequeued task to a terminal queue status. Returns the status
    /// written; only storage failures propagate.
    async fn delegate(&self, task: &OvernightTask) -> Result<TaskStatus> {
        let (status, error) = match self.coordinator.run_task(task).await {
            Ok(result) => {
                self.queue
                    .attach_session(&task.id, &result.session_id)
                    .await?;
                let status = match result.state {
                    SessionState::Completed => TaskStatus::Completed,
                    SessionState::Cancelled => TaskStatus::Cancelled,
                    _ => TaskStatus::Failed,
                };
                let error = match status {
                    TaskStatus::Completed => None,
                    _ => Some(
                        result
                            .error
                            .clone()
                            .filter(|e| !e.is_empty())
                            .unwrap_or_else(|| String::from("session ended abnormally")),
                    ),
                };
                self.remember(result);
                (status, error)
            }
            Err(e @ NightshiftError::AgentNotAvailable(_)) => {
                warn!(task_id = %task.id, error = %e, "delegation refused");
                (TaskStatus::Failed, Some(e.to_string()))
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "delegation failed");
                (TaskStatus::Failed, Some(e.to_string()))
            }
        };

        self.queue
            .update_status(&task.id, status, error.clone())
            .await?;

        let event = match status {
            TaskStatus::Completed => {
                NightEvent::new(EventKind::TaskCompleted, task.decision.task.clone())
            }
            _ => NightEvent::new(
                EventKind::TaskFailed,
                format!(
                    "{}: {}",
                    task.decision.task,
                    error.as_deref().unwrap_or("cancelled")
                ),
            ),
        };
        self.notifier.emit(&event.with_task(task.id.clone())).await;
        Ok(status)
    }

    fn remember(&self, result: AgentSessionResult) {
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_RESULTS {
            recent.pop_front();
        }
        recent.push_back(result);
    }
}

#[async_trait::async_trait]
impl WakeHandler for Orchestrator {
    async fn on_wake(&self) -> Result<()> {
        self.run_cycle().await.map(|_| ())
    }

    async fn on_force_stop(&self) {
        // Closes admission too, so tasks still waiting on a permit wind
        // down as cancelled instead of starting doomed sessions.
        self.coordinator.shutdown();
    }
}
