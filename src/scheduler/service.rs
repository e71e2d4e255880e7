use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MissedWakePolicy, OrchestrationConfig};
use crate::constraint::ConstraintGate;
use crate::error::{NightshiftError, Result};
use crate::scheduler::keep_awake::KeepAwake;
use crate::scheduler::wake::WakePlanner;

/// Status snapshot file name, under the state directory.
pub const STATUS_FILE: &str = "scheduler.json";

const STATUS_VERSION: u8 = 1;

/// Receiver side of a wake: the orchestrator implements this.
#[async_trait]
pub trait WakeHandler: Send + Sync {
    /// Run one work cycle. Errors are recorded, never fatal to the loop.
    async fn on_wake(&self) -> Result<()>;

    /// Called on shutdown so an in-flight cycle can wind down quickly.
    async fn on_force_stop(&self) {}
}

/// Lifecycle of the scheduler loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running { next_wake: DateTime<Utc> },
    Paused { reason: String },
    Stopped,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running { .. } => "running",
            SchedulerState::Paused { .. } => "paused",
            SchedulerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters and timestamps exposed by `status` tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerMetrics {
    pub cycle_count: u64,
    pub missed_wakes: u64,
    pub constraint_pauses: u64,
    pub consecutive_failures: u64,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_cycle_error: Option<String>,
    pub next_wake_time: Option<DateTime<Utc>>,
}

/// On-disk form of the scheduler state, written after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default = "default_status_version")]
    pub version: u8,
    pub state: SchedulerState,
    #[serde(default)]
    pub metrics: SchedulerMetrics,
    pub written_at: DateTime<Utc>,
}

fn default_status_version() -> u8 {
    STATUS_VERSION
}

/// Unattended wake loop.
///
/// Plans the next wake from the schedule, sleeps to it, applies the
/// missed-wake policy when the process comes back late, gates the cycle
/// on system constraints and hands satisfied wakes to the
/// [`WakeHandler`]. A keep-awake assertion is held for the duration of
/// each cycle.
pub struct SchedulerService {
    core: Arc<Core>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Core {
    planner: WakePlanner,
    gate: ConstraintGate,
    keep_awake: KeepAwake,
    handler: Arc<dyn WakeHandler>,
    state: RwLock<SchedulerState>,
    metrics: RwLock<SchedulerMetrics>,
    status_path: Option<PathBuf>,
}

impl SchedulerService {
    /// Service with platform probes and a system keep-awake assertion.
    pub fn new(config: &OrchestrationConfig, handler: Arc<dyn WakeHandler>) -> Result<Self> {
        Self::with_parts(
            config,
            handler,
            ConstraintGate::new(config.constraints.clone()),
            KeepAwake::system(),
        )
    }

    /// Service with an injected gate and keep-awake implementation.
    pub fn with_parts(
        config: &OrchestrationConfig,
        handler: Arc<dyn WakeHandler>,
        gate: ConstraintGate,
        keep_awake: KeepAwake,
    ) -> Result<Self> {
        config.validate()?;
        let planner = WakePlanner::from_config(&config.schedule)?;
        let status_path = config.state_dir().join(STATUS_FILE);

        // Counters survive restarts; the lifecycle state does not.
        let metrics = match load_status(&status_path) {
            Ok(Some(snapshot)) => SchedulerMetrics {
                next_wake_time: None,
                ..snapshot.metrics
            },
            Ok(None) => SchedulerMetrics::default(),
            Err(e) => {
                warn!(error = %e, "cannot read previous scheduler status, starting fresh");
                SchedulerMetrics::default()
            }
        };

        let (stop, _) = watch::channel(false);
        Ok(Self {
            core: Arc::new(Core {
                planner,
                gate,
                keep_awake,
                handler,
                state: RwLock::new(SchedulerState::Idle),
                metrics: RwLock::new(metrics),
                status_path: Some(status_path),
            }),
            stop,
            handle: Mutex::new(None),
        })
    }

    /// Spawn the wake loop. Fails if the service was already started.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.handle.lock();
        if guard.is_some() || *self.stop.borrow() {
            return Err(NightshiftError::Other(String::from(
                "scheduler already started",
            )));
        }
        let core = Arc::clone(&self.core);
        let stop_rx = self.stop.subscribe();
        *guard = Some(tokio::spawn(run_loop(core, stop_rx)));
        info!("scheduler started");
        Ok(())
    }

    /// Graceful stop: no new wakes, an in-flight cycle finishes on its own.
    pub async fn stop(&self) {
        self.shutdown(false).await;
    }

    /// Forced stop: additionally asks the handler to cancel in-flight work.
    pub async fn stop_force(&self) {
        self.shutdown(true).await;
    }

    async fn shutdown(&self, force: bool) {
        let _ = self.stop.send(true);
        if force {
            self.core.handler.on_force_stop().await;
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler loop did not exit cleanly");
            }
        }

        self.core.set_state(SchedulerState::Stopped);
        self.core.persist();
        info!("scheduler stopped");
    }

    pub fn status(&self) -> SchedulerState {
        self.core.state.read().clone()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.core.metrics.read().clone()
    }
}

async fn run_loop(core: Arc<Core>, mut stop_rx: watch::Receiver<bool>) {
    let mut last_due: Option<DateTime<Utc>> = None;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let now = Utc::now();
        let due = match last_due {
            Some(prev) => core.planner.next_due_after(prev, now),
            None => core.planner.next_due(now),
        };
        eprintln!("DBG loop top last_due={:?} now={:?} due={:?}", last_due, Utc::now(), due);
        let Some(due) = due else {
            eprintln!("DBG idle branch");
            warn!("schedule has no future occurrence, scheduler idling");
            core.set_state(SchedulerState::Idle);
            core.persist();
            if stop_rx.changed().await.is_err() {
                break;
            }
            continue;
        };
        let wake_at = core.planner.with_jitter(due);
        last_due = Some(due);

        core.set_state(SchedulerState::Running { next_wake: wake_at });
        core.metrics.write().next_wake_time = Some(wake_at);
        core.persist();
        debug!(due = %due, wake_at = %wake_at, "next wake planned");

        let wait = (wake_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        eprintln!("DBG sleep start wait={:?} vnow={:?}", wait, tokio::time::Instant::now());
        tokio::select! {
            _ = tokio::time::sleep(wait) => { eprintln!("DBG sleep fired vnow={:?}", tokio::time::Instant::now()); }
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        match classify_wake(&core.planner, wake_at, Utc::now()) {
            WakeDisposition::OnTime => {}
            WakeDisposition::Late => {
                core.metrics.write().missed_wakes += 1;
                info!(planned = %wake_at, "missed wake, running once now");
            }
            WakeDisposition::Skipped => {
                core.metrics.write().missed_wakes += 1;
                info!(planned = %wake_at, "missed wake skipped");
                continue;
            }
        }

        eprintln!("DBG pre constraints");
        if !core.wait_for_constraints(&mut stop_rx).await {
            continue;
        }
        eprintln!("DBG pre run_cycle");
        core.run_cycle(due).await;
        eprintln!("DBG post run_cycle");
    }

    info!("scheduler loop exited");
}

/// How to handle a wake given how late it is being serviced.
#[derive(Debug, PartialEq, Eq)]
enum WakeDisposition {
    OnTime,
    Late,
    Skipped,
}

fn classify_wake(planner: &WakePlanner, planned: DateTime<Utc>, now: DateTime<Utc>) -> WakeDisposition {
    if !planner.is_missed(planned, now) {
        return WakeDisposition::OnTime;
    }
    match planner.missed_policy() {
        MissedWakePolicy::Skip => WakeDisposition::Skipped,
        MissedWakePolicy::RunOnceAtNextOpportunity => WakeDisposition::Late,
    }
}

impl Core {
    /// Re-check constraints until satisfied, pausing in between.
    /// Returns false when stop was requested while paused.
    async fn wait_for_constraints(&self, stop_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.gate.check_all().await {
                Ok(()) => return true,
                Err(e @ NightshiftError::ConstraintUnsatisfied { .. }) => {
                    let reason = e.to_string();
                    let retry = self.planner.constraint_retry(Utc::now());
                    warn!(reason = %reason, retry_secs = retry.as_secs(), "wake paused by constraint");
                    self.metrics.write().constraint_pauses += 1;
                    self.set_state(SchedulerState::Paused { reason });
                    self.persist();
                    tokio::select! {
                        _ = tokio::time::sleep(retry) => {}
                        _ = stop_rx.changed() => return false,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "constraint check failed, proceeding");
                    return true;
                }
            }
        }
    }

    /// Run one cycle under a keep-awake hold. Failures and panics are
    /// recorded in the metrics and the loop carries on.
    async fn run_cycle(&self, due: DateTime<Utc>) {
        let _hold = self.keep_awake.hold();
        // The wake being serviced is already in the past; advertise the
        // occurrence after it while the cycle runs. Jitter is re-applied
        // when the loop actually plans that wake.
        if let Some(next) = self.planner.next_due_after(due, Utc::now()) {
            self.set_state(SchedulerState::Running { next_wake: next });
            self.metrics.write().next_wake_time = Some(next);
        }
        let started = Utc::now();
        info!("work cycle starting");

        eprintln!("DBG on_wake begin");
        let outcome = AssertUnwindSafe(self.handler.on_wake()).catch_unwind().await;
        eprintln!("DBG on_wake end");
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(error = %e, "work cycle failed");
                Some(e.to_string())
            }
            Err(_) => {
                error!("work cycle panicked");
                Some(String::from("cycle panicked"))
            }
        };

        let elapsed = (Utc::now() - started).num_seconds();
        {
            let mut metrics = self.metrics.write();
            metrics.cycle_count += 1;
            metrics.last_run_time = Some(started);
            if error.is_some() {
                metrics.consecutive_failures += 1;
            } else {
                metrics.consecutive_failures = 0;
            }
            metrics.last_cycle_error = error;
        }
        self.persist();
        info!(elapsed_secs = elapsed, "work cycle finished");
    }

    fn set_state(&self, next: SchedulerState) {
        *self.state.write() = next;
    }

    fn persist(&self) {
        let Some(path) = &self.status_path else {
            return;
        };
        let snapshot = StatusSnapshot {
            version: STATUS_VERSION,
            state: self.state.read().clone(),
            metrics: self.metrics.read().clone(),
            written_at: Utc::now(),
        };
        if let Err(e) = write_status(path, &snapshot) {
            warn!(error = %e, "cannot persist scheduler status");
        }
    }
}

fn write_status(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a persisted status snapshot. Missing file yields `None`.
pub fn load_status(path: &Path) -> Result<Option<StatusSnapshot>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
