use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{NightshiftError, Result};

/// Opaque request/response call into an external model. The prompt goes to
/// the backend verbatim; the raw completion comes back untouched.
#[async_trait]
pub trait DecisionBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

fn backend_err(msg: impl std::fmt::Display) -> NightshiftError {
    NightshiftError::DecisionBackend(msg.to_string())
}

/// Runs a user-configured shell command, writing the prompt to its stdin
/// and reading the completion from its stdout.
pub struct CommandBackend {
    command: String,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(command: impl Into<String>, timeout_sec: u64) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(timeout_sec.max(1)),
        }
    }
}

#[async_trait]
impl DecisionBackend for CommandBackend {
    async fn complete(&self, prompt: &str) -> Result<String> {
        #[cfg(not(target_os = "windows"))]
        let mut cmd = {
            let mut c = Command::new("sh");
            c.arg("-c");
            c
        };
        #[cfg(target_os = "windows")]
        let mut cmd = {
            let mut c = Command::new("cmd");
            c.arg("/C");
            c
        };

        let mut child = cmd
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| backend_err(format!("failed to spawn \"{}\": {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| backend_err(format!("failed to write prompt: {}", e)))?;
            // Closing stdin lets line-buffered backends finish.
            drop(stdin);
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| backend_err(format!("\"{}\" timed out", self.command)))?
            .map_err(|e| backend_err(format!("failed to read output: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(backend_err(format!(
                "\"{}\" exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
