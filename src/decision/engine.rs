use async_trait::async_trait;

use super::context::DecisionContext;
use crate::error::Result;
use crate::queue::TaskDecision;

/// Chooses what work to do next.
///
/// Engines are consulted once per cycle with a fresh context and return up
/// to `context.max_tasks` decisions, highest priority first. An engine must
/// only name agents from `context.available_agents`.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    /// Engine name, for logs and cycle reports.
    fn name(&self) -> &'static str;

    async fn decide(&self, context: &DecisionContext) -> Result<Vec<TaskDecision>>;
}
