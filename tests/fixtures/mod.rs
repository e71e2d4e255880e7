#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use nightshift::agent::{AgentProvider, SessionUpdate};
use nightshift::config::{OrchestrationConfig, ScheduleConfig};
use nightshift::constraint::SystemProbe;
use nightshift::error::Result;
use nightshift::queue::{TaskDecision, TaskPriority};

/// Config rooted in a temp dir: every-minute cadence, all-day window, no
/// jitter, no constraints.
pub fn test_config(dir: &Path) -> OrchestrationConfig {
    OrchestrationConfig {
        workspace_root: dir.display().to_string(),
        state_dir: dir.display().to_string(),
        schedule: ScheduleConfig {
            expression: String::from("* * * * *"),
            window_start: String::from("00:00"),
            window_end: String::from("23:59"),
            jitter_ms: 0,
            ..ScheduleConfig::default()
        },
        ..OrchestrationConfig::default()
    }
}

pub fn decision(task: &str, agent: &str, priority: TaskPriority) -> TaskDecision {
    TaskDecision::new(task, agent, priority, 600, "fixture decision")
}

/// One scripted step of a fake agent session.
#[derive(Clone)]
pub enum Step {
    Output(&'static str),
    Tool(&'static str),
    Wait(u64),
    Finish(bool, Option<&'static str>),
    /// Never terminates; only a cancel or the budget ends the session.
    Hang,
}

/// In-memory [`AgentProvider`] that replays scripts in start order and
/// records what the coordinator did to it.
pub struct ScriptedProvider {
    id: String,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    /// Script used once the queue above is exhausted.
    default_script: Vec<Step>,
    pub started: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
    concurrent: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(id: &str, scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            scripts: Mutex::new(scripts.into()),
            default_script: vec![Step::Finish(true, None)],
            started: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            concurrent: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Highest number of sessions observed running at once.
    pub fn peak_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Provider that completes every session immediately.
    pub fn completing(id: &str) -> Arc<Self> {
        Self::new(id, Vec::new())
    }

    /// Provider that fails every session with the given message.
    pub fn failing(id: &str, error: &'static str) -> Arc<Self> {
        let mut provider = Self::new(id, Vec::new());
        Arc::get_mut(&mut provider)
            .expect("fresh provider is uniquely owned")
            .default_script = vec![Step::Finish(false, Some(error))];
        provider
    }

    /// Provider whose sessions never terminate on their own.
    pub fn hanging(id: &str) -> Arc<Self> {
        let mut provider = Self::new(id, Vec::new());
        Arc::get_mut(&mut provider)
            .expect("fresh provider is uniquely owned")
            .default_script = vec![Step::Hang];
        provider
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(
        &self,
        session_id: &str,
        _prompt: &str,
        _working_dir: &Path,
    ) -> Result<mpsc::Receiver<SessionUpdate>> {
        self.started.lock().push(session_id.to_string());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_script.clone());

        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        let done = DecrementOnDrop(Arc::clone(&self.concurrent));
        tokio::spawn(async move {
            let _done = done;
            for step in script {
                match step {
                    Step::Output(text) => {
                        let _ = tx.send(SessionUpdate::Output { text: text.into() }).await;
                    }
                    Step::Tool(name) => {
                        let _ = tx
                            .send(SessionUpdate::ToolCall {
                                name: name.into(),
                                target: None,
                            })
                            .await;
                    }
                    Step::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                    Step::Finish(success, error) => {
                        let _ = tx
                            .send(SessionUpdate::Terminal {
                                success,
                                error: error.map(String::from),
                            })
                            .await;
                    }
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
        });
        Ok(rx)
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        self.cancelled.lock().push(session_id.to_string());
        Ok(())
    }
}

/// A host that looks healthy except it runs on battery.
pub struct OnBatteryProbe;

#[async_trait]
impl SystemProbe for OnBatteryProbe {
    async fn on_ac_power(&self) -> Result<bool> {
        Ok(false)
    }

    async fn on_wifi(&self) -> Result<bool> {
        Ok(true)
    }

    async fn cpu_usage_percent(&self) -> Result<u8> {
        Ok(5)
    }

    async fn do_not_disturb(&self) -> Result<bool> {
        Ok(false)
    }

    async fn seconds_since_user_input(&self) -> Result<u64> {
        Ok(3600)
    }
}

/// Decrements the shared concurrency counter when a session task ends,
/// including when it is dropped by a cancel or budget abort.
struct DecrementOnDrop(Arc<AtomicUsize>);

impl Drop for DecrementOnDrop {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
