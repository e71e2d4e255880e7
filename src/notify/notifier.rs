use std::path::PathBuf;

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::notify::events::NightEvent;

/// Fire-and-forget delivery of cycle events: an append-only log line
/// and an optional user hook command. Nothing here can fail a cycle.
#[derive(Clone)]
pub struct Notifier {
    config: NotifyConfig,
    log_path: Option<PathBuf>,
}

impl Notifier {
    pub fn new(config: NotifyConfig, state_dir: Option<PathBuf>) -> Self {
        let log_path = state_dir.map(|dir| dir.join("events.log"));
        Self { config, log_path }
    }

    /// A notifier that delivers nothing.
    pub fn disabled() -> Self {
        Self {
            config: NotifyConfig {
                event_log: false,
                hook_command: None,
            },
            log_path: None,
        }
    }

    pub async fn emit(&self, event: &NightEvent) {
        if self.config.event_log {
            self.append_log(event).await;
        }

        if let Some(hook) = &self.config.hook_command {
            if !hook.trim().is_empty() {
                self.run_hook(hook, event).await;
            }
        }
    }

    async fn append_log(&self, event: &NightEvent) {
        let Some(log_path) = &self.log_path else {
            return;
        };

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("[{}] {}: {}\n", timestamp, event.kind.as_str(), event.message);

        if let Some(parent) = log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "cannot create event log directory");
                return;
            }
        }

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await;
        match result {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "cannot write event log");
                }
            }
            Err(e) => {
                warn!(error = %e, path = %log_path.display(), "cannot open event log");
            }
        }
    }

    async fn run_hook(&self, hook_cmd: &str, event: &NightEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(_) => return,
        };

        #[cfg(not(target_os = "windows"))]
        let mut command = {
            let mut c = Command::new("sh");
            c.args(["-c", hook_cmd]);
            c
        };
        #[cfg(target_os = "windows")]
        let mut command = {
            let mut c = Command::new("cmd");
            c.args(["/C", hook_cmd]);
            c
        };

        let result = command
            .env("NIGHTSHIFT_EVENT", event.kind.as_str())
            .env("NIGHTSHIFT_TASK_ID", event.task_id.as_deref().unwrap_or(""))
            .env("NIGHTSHIFT_EVENT_JSON", &json)
            .output()
            .await;

        match result {
            Ok(output) if !output.status.success() => {
                debug!(hook = %hook_cmd, status = %output.status, "hook exited non-zero");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, hook = %hook_cmd, "cannot run hook");
            }
        }
    }
}
