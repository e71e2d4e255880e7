use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One update from a delegated coding-agent session.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// A chunk of agent output, usually one line.
    Output { text: String },
    /// The agent invoked a tool.
    ToolCall {
        name: String,
        target: Option<String>,
    },
    /// The session ended. Exactly one terminal update closes a healthy
    /// stream; a stream that closes without one counts as a failure.
    Terminal {
        success: bool,
        error: Option<String>,
    },
}

/// A pluggable coding-agent capability.
///
/// The coordinator treats implementations as opaque: start a session, read
/// its update stream, cancel it. Providers must tolerate `cancel` for
/// sessions they no longer know about.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Stable id this provider is registered under.
    fn id(&self) -> &str;

    /// Launch the work and return the session's update stream. The stream
    /// ends with a `Terminal` update unless the provider dies first.
    async fn start(
        &self,
        session_id: &str,
        prompt: &str,
        working_dir: &Path,
    ) -> Result<mpsc::Receiver<SessionUpdate>>;

    /// Stop a running session. Idempotent.
    async fn cancel(&self, session_id: &str) -> Result<()>;
}
