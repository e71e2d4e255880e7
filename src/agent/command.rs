use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use super::provider::{AgentProvider, SessionUpdate};
use crate::config::AgentCommandConfig;
use crate::error::{NightshiftError, Result};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Runs a command-line coding agent as a subprocess, one process per
/// session.
///
/// The prompt is substituted for any `{prompt}` placeholder in the
/// configured args; without a placeholder it is written to the agent's
/// stdin instead. Stdout lines become `Output` updates and the exit status
/// becomes the `Terminal` update.
pub struct CommandAgent {
    id: String,
    config: AgentCommandConfig,
    kill_signals: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl CommandAgent {
    pub fn new(id: impl Into<String>, config: AgentCommandConfig) -> Self {
        Self {
            id: id.into(),
            config,
            kill_signals: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl AgentProvider for CommandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(
        &self,
        session_id: &str,
        prompt: &str,
        working_dir: &Path,
    ) -> Result<mpsc::Receiver<SessionUpdate>> {
        let has_placeholder = self.config.args.iter().any(|a| a.contains("{prompt}"));
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| a.replace("{prompt}", prompt))
            .collect();

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NightshiftError::AgentSession(format!(
                    "failed to spawn agent \"{}\": {}",
                    self.config.command, e
                ))
            })?;

        let stdin = child.stdin.take();
        if let Some(mut stdin) = stdin {
            if has_placeholder {
                drop(stdin);
            } else {
                let text = prompt.to_string();
                // Written off-task so a large prompt cannot deadlock against
                // an agent that talks before it reads.
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(text.as_bytes()).await {
                        debug!(error = %e, "Failed to write prompt to agent stdin");
                    }
                });
            }
        }

        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let kill = Arc::new(Notify::new());
        self.kill_signals
            .lock()
            .insert(session_id.to_string(), Arc::clone(&kill));

        let signals = Arc::clone(&self.kill_signals);
        let session = session_id.to_string();
        tokio::spawn(async move {
            pump(child, tx, kill).await;
            signals.lock().remove(&session);
        });

        Ok(rx)
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        let signal = self.kill_signals.lock().get(session_id).cloned();
        if let Some(signal) = signal {
            signal.notify_one();
        }
        Ok(())
    }
}

async fn pump(mut child: Child, tx: mpsc::Sender<SessionUpdate>, kill: Arc<Notify>) {
    let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());

    loop {
        let next_line = async {
            match lines.as_mut() {
                Some(lines) => lines.next_line().await,
                None => Ok(None),
            }
        };
        tokio::select! {
            line = next_line => match line {
                Ok(Some(text)) => {
                    let update =
                        parse_tool_marker(&text).unwrap_or(SessionUpdate::Output { text });
                    if tx.send(update).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Agent stdout read failed");
                    break;
                }
            },
            _ = kill.notified() => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Failed to kill agent process");
                }
                let _ = child.wait().await;
                let _ = tx
                    .send(SessionUpdate::Terminal {
                        success: false,
                        error: Some(String::from("session cancelled")),
                    })
                    .await;
                return;
            }
        }
    }

    let terminal = match child.wait().await {
        Ok(status) if status.success() => SessionUpdate::Terminal {
            success: true,
            error: None,
        },
        Ok(status) => SessionUpdate::Terminal {
            success: false,
            error: Some(format!("agent exited with {}", status)),
        },
        Err(e) => SessionUpdate::Terminal {
            success: false,
            error: Some(format!("failed to reap agent process: {}", e)),
        },
    };
    let _ = tx.send(terminal).await;
}

/// Line protocol for tool activity: `@tool <name> [target]`. Anything
/// else streams through as plain output.
fn parse_tool_marker(line: &str) -> Option<SessionUpdate> {
    let rest = line.strip_prefix("@tool ")?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let target = parts
        .next()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    Some(SessionUpdate::ToolCall {
        name: name.to_string(),
        target,
    })
}

#[cfg(test)]
#[cfg(not(target_os = "windows"))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shell_agent(script: &str) -> CommandAgent {
        CommandAgent::new(
            "shell",
            AgentCommandConfig {
                command: String::from("sh"),
                args: vec![String::from("-c"), String::from(script)],
            },
        )
    }

    async fn collect(mut rx: mpsc::Receiver<SessionUpdate>) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Ok(Some(update)) = timeout(Duration::from_secs(10), rx.recv()).await {
            let terminal = matches!(update, SessionUpdate::Terminal { .. });
            updates.push(update);
            if terminal {
                break;
            }
        }
        updates
    }

    fn outputs(updates: &[SessionUpdate]) -> Vec<&str> {
        updates
            .iter()
            .filter_map(|u| match u {
                SessionUpdate::Output { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_streams_stdout_then_reports_success() {
        let agent = shell_agent("echo one; echo two");
        let rx = agent.start("s1", "ignored", Path::new(".")).await.unwrap();
        let updates = collect(rx).await;

        assert_eq!(outputs(&updates), ["one", "two"]);
        assert!(matches!(
            updates.last(),
            Some(SessionUpdate::Terminal { success: true, error: None })
        ));
    }

    #[test]
    fn test_tool_marker_parsing() {
        assert!(matches!(
            parse_tool_marker("@tool edit src/lib.rs"),
            Some(SessionUpdate::ToolCall { name, target: Some(t) })
                if name == "edit" && t == "src/lib.rs"
        ));
        assert!(matches!(
            parse_tool_marker("@tool build"),
            Some(SessionUpdate::ToolCall { name, target: None }) if name == "build"
        ));
        assert!(parse_tool_marker("plain progress line").is_none());
        assert!(parse_tool_marker("@tool ").is_none());
    }

    #[tokio::test]
    async fn test_tool_marker_lines_become_tool_events() {
        let agent = shell_agent("echo '@tool edit src/lib.rs'; echo plain");
        let rx = agent.start("s-tool", "ignored", Path::new(".")).await.unwrap();
        let updates = collect(rx).await;

        assert!(matches!(
            &updates[0],
            SessionUpdate::ToolCall { name, target: Some(t) }
                if name == "edit" && t == "src/lib.rs"
        ));
        assert_eq!(outputs(&updates), ["plain"]);
    }

    #[tokio::test]
    async fn test_prompt_placeholder_is_substituted() {
        let agent = CommandAgent::new(
            "echoer",
            AgentCommandConfig {
                command: String::from("echo"),
                args: vec![String::from("{prompt}")],
            },
        );
        let rx = agent
            .start("s1", "work on the parser", Path::new("."))
            .await
            .unwrap();
        let updates = collect(rx).await;
        assert_eq!(outputs(&updates), ["work on the parser"]);
    }

    #[tokio::test]
    async fn test_prompt_goes_to_stdin_without_placeholder() {
        let agent = CommandAgent::new(
            "cat",
            AgentCommandConfig {
                command: String::from("cat"),
                args: vec![],
            },
        );
        let rx = agent.start("s1", "from stdin", Path::new(".")).await.unwrap();
        let updates = collect(rx).await;
        assert_eq!(outputs(&updates), ["from stdin"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_failure() {
        let agent = shell_agent("exit 7");
        let rx = agent.start("s1", "ignored", Path::new(".")).await.unwrap();
        let updates = collect(rx).await;

        match updates.last() {
            Some(SessionUpdate::Terminal { success, error }) => {
                assert!(!success);
                assert!(error.as_deref().unwrap().contains('7'));
            }
            other => panic!("expected terminal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_the_process() {
        let agent = shell_agent("sleep 30");
        let rx = agent.start("s1", "ignored", Path::new(".")).await.unwrap();
        agent.cancel("s1").await.unwrap();
        let updates = collect(rx).await;

        match updates.last() {
            Some(SessionUpdate::Terminal { success: false, error }) => {
                assert_eq!(error.as_deref(), Some("session cancelled"));
            }
            other => panic!("expected cancelled terminal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_unknown_session_is_a_no_op() {
        let agent = shell_agent("true");
        assert!(agent.cancel("never-started").await.is_ok());
    }
}
