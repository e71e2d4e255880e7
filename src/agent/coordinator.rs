use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provider::{AgentProvider, SessionUpdate};
use super::session::{AgentSessionResult, SessionInfo, SessionState};
use crate::error::{NightshiftError, Result};
use crate::queue::OvernightTask;

/// A session may run this much longer than its estimate before it is
/// cancelled.
const BUDGET_FACTOR: f64 = 1.5;

/// How long a cancelled provider gets to deliver its terminal update.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

const OUTPUT_TAIL_LINES: usize = 50;
const SESSION_EVENT_CAPACITY: usize = 256;

fn scaled_budget(estimated_secs: u64) -> u64 {
    ((estimated_secs.max(1)) as f64 * BUDGET_FACTOR).round() as u64
}

struct SessionHandle {
    info: SessionInfo,
    cancel: watch::Sender<bool>,
    updates: broadcast::Sender<SessionUpdate>,
}

/// Owns every delegated agent session.
///
/// Admission is a FIFO semaphore capped at `max_concurrent`; each admitted
/// session gets a wall-clock budget of `estimate × 1.5` that is enforced
/// with a deadline independent of the provider's update stream, so even a
/// silent provider cannot overstay. Cancellation is cooperative: a watch
/// signal per session, plus a provider-side `cancel` call.
pub struct AgentCoordinator {
    providers: RwLock<HashMap<String, Arc<dyn AgentProvider>>>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    workspace_root: PathBuf,
    closed: AtomicBool,
}

impl AgentCoordinator {
    pub fn new(workspace_root: impl Into<PathBuf>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            providers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            workspace_root: workspace_root.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register(&self, provider: Arc<dyn AgentProvider>) {
        let id = provider.id().to_string();
        debug!(agent = %id, "Registered agent provider");
        self.providers.write().insert(id, provider);
    }

    /// Registered agent ids, sorted.
    pub fn available_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run one task to a terminal session result.
    ///
    /// Session-level failures (budget exceeded, provider start failure,
    /// broken update stream) come back as a `Failed` result, not an `Err`;
    /// `Err` is reserved for asking for an agent that is not registered.
    pub async fn run_task(&self, task: &OvernightTask) -> Result<AgentSessionResult> {
        let decision = &task.decision;
        let provider = self
            .providers
            .read()
            .get(&decision.agent)
            .cloned()
            .ok_or_else(|| NightshiftError::AgentNotAvailable(decision.agent.clone()))?;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| NightshiftError::AgentSession(String::from("coordinator closed")))?;

        let session_id = Uuid::new_v4().to_string();
        let budget_secs = scaled_budget(decision.estimated_duration_sec);

        // A shutdown may have arrived while this request waited for a
        // permit; never start a session after it.
        if self.closed.load(Ordering::SeqCst) {
            let now = Utc::now();
            return Ok(AgentSessionResult {
                session_id,
                task_id: task.id.clone(),
                agent: decision.agent.clone(),
                task: decision.task.clone(),
                state: SessionState::Cancelled,
                started_at: now,
                finished_at: now,
                duration_secs: 0,
                output_tail: Vec::new(),
                tool_calls: 0,
                budget_secs,
                error: Some(String::from("coordinator shut down before the session started")),
            });
        }

        let started_at = Utc::now();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (updates_tx, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        self.sessions.write().insert(
            session_id.clone(),
            SessionHandle {
                info: SessionInfo {
                    session_id: session_id.clone(),
                    task_id: task.id.clone(),
                    agent: decision.agent.clone(),
                    task: decision.task.clone(),
                    state: SessionState::Starting,
                    started_at,
                    budget_secs,
                },
                cancel: cancel_tx,
                updates: updates_tx.clone(),
            },
        );

        info!(
            session_id = %session_id,
            agent = %decision.agent,
            budget_secs,
            "Starting agent session"
        );

        let mut tail: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        let mut tool_calls: u32 = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(budget_secs);

        let (final_state, error) = 'session: {
            let mut updates = match provider
                .start(&session_id, &decision.task, &self.workspace_root)
                .await
            {
                Ok(rx) => rx,
                Err(e) => break 'session (SessionState::Failed, Some(e.to_string())),
            };
            self.set_state(&session_id, SessionState::Running);

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(SessionUpdate::Output { text }) => {
                            let _ = updates_tx.send(SessionUpdate::Output { text: text.clone() });
                            if tail.len() == OUTPUT_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(text);
                        }
                        Some(SessionUpdate::ToolCall { name, target }) => {
                            tool_calls += 1;
                            let _ = updates_tx.send(SessionUpdate::ToolCall { name, target });
                        }
                        Some(SessionUpdate::Terminal { success, error }) => {
                            let _ = updates_tx.send(SessionUpdate::Terminal {
                                success,
                                error: error.clone(),
                            });
                            self.set_state(&session_id, SessionState::Completing);
                            if success {
                                break 'session (SessionState::Completed, None);
                            }
                            break 'session (
                                SessionState::Failed,
                                Some(error.unwrap_or_else(|| {
                                    String::from("agent reported failure")
                                })),
                            );
                        }
                        None => break 'session (
                            SessionState::Failed,
                            Some(String::from("update stream closed without a terminal state")),
                        ),
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(
                            session_id = %session_id,
                            budget_secs,
                            "Time budget exceeded; cancelling session"
                        );
                        if let Err(e) = provider.cancel(&session_id).await {
                            debug!(error = %e, "Provider cancel failed");
                        }
                        // Work that finished during the cancel round-trip
                        // still counts; wait briefly for a terminal update.
                        if let Some((success, error)) =
                            drain_for_terminal(&mut updates, &updates_tx, CANCEL_GRACE).await
                        {
                            self.set_state(&session_id, SessionState::Completing);
                            if success {
                                break 'session (SessionState::Completed, None);
                            }
                            break 'session (
                                SessionState::Failed,
                                Some(error.unwrap_or_else(|| {
                                    String::from("agent reported failure")
                                })),
                            );
                        }
                        let reason = NightshiftError::TimeBudgetExceeded {
                            session_id: session_id.clone(),
                            budget_secs,
                        };
                        break 'session (SessionState::Failed, Some(reason.to_string()));
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_ok() && *cancel_rx.borrow() {
                            if let Err(e) = provider.cancel(&session_id).await {
                                debug!(error = %e, "Provider cancel failed");
                            }
                            break 'session (
                                SessionState::Cancelled,
                                Some(String::from("cancelled by request")),
                            );
                        }
                    }
                }
            }
        };

        self.set_state(&session_id, final_state);
        self.sessions.write().remove(&session_id);
        drop(permit);

        let finished_at = Utc::now();
        let result = AgentSessionResult {
            session_id: session_id.clone(),
            task_id: task.id.clone(),
            agent: decision.agent.clone(),
            task: decision.task.clone(),
            state: final_state,
            started_at,
            finished_at,
            duration_secs: (finished_at - started_at).num_seconds().max(0) as u64,
            output_tail: tail.into(),
            tool_calls,
            budget_secs,
            error,
        };
        info!(
            session_id = %session_id,
            state = %result.state,
            duration_secs = result.duration_secs,
            "Agent session finished"
        );
        Ok(result)
    }

    /// Ask a live session to stop. The result still comes back through the
    /// `run_task` call that owns it.
    pub fn cancel_session(&self, session_id: &str) -> Result<()> {
        let sessions = self.sessions.read();
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| NightshiftError::SessionNotFound(session_id.to_string()))?;
        let _ = handle.cancel.send(true);
        Ok(())
    }

    pub fn cancel_all(&self) {
        for handle in self.sessions.read().values() {
            let _ = handle.cancel.send(true);
        }
    }

    /// Cancel every active session and refuse to start new ones. Terminal;
    /// used on forced shutdown.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all();
    }

    /// Updates of one live session, from the moment of subscription.
    pub fn monitor_session(&self, session_id: &str) -> Result<broadcast::Receiver<SessionUpdate>> {
        let sessions = self.sessions.read();
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| NightshiftError::SessionNotFound(session_id.to_string()))?;
        Ok(handle.updates.subscribe())
    }

    /// Live sessions ordered by start time.
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .map(|h| h.info.clone())
            .collect();
        infos.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        infos
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn set_state(&self, session_id: &str, next: SessionState) {
        let mut sessions = self.sessions.write();
        if let Some(handle) = sessions.get_mut(session_id) {
            let current = handle.info.state;
            if current.can_transition_to(next) {
                handle.info.state = next;
            } else {
                warn!(
                    session_id,
                    from = %current,
                    to = %next,
                    "Ignoring illegal session transition"
                );
            }
        }
    }
}

/// Drain a session's update stream until a terminal update, the stream
/// closes, or the grace window runs out. Terminal updates are re-broadcast
/// to monitors.
async fn drain_for_terminal(
    updates: &mut mpsc::Receiver<SessionUpdate>,
    monitors: &broadcast::Sender<SessionUpdate>,
    grace: Duration,
) -> Option<(bool, Option<String>)> {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match tokio::time::timeout_at(deadline, updates.recv()).await {
            Ok(Some(SessionUpdate::Terminal { success, error })) => {
                let _ = monitors.send(SessionUpdate::Terminal {
                    success,
                    error: error.clone(),
                });
                return Some((success, error));
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}
