use std::sync::Arc;

use async_trait::async_trait;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backend::DecisionBackend;
use super::context::DecisionContext;
use super::engine::DecisionEngine;
use super::heuristic::HeuristicEngine;
use crate::error::{NightshiftError, Result};
use crate::queue::TaskDecision;

/// Wire format the backend must reply with.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct DecisionPlan {
    decisions: Vec<TaskDecision>,
}

/// Delegates decision-making to an external model behind a
/// [`DecisionBackend`]. A response that cannot be used (unreachable backend,
/// malformed JSON, schema or validation failure) is retried once with a
/// corrective instruction naming the problem; a second failure falls back
/// to the held heuristic engine, so `decide` itself never surfaces a
/// backend error.
pub struct GenerativeEngine {
    backend: Arc<dyn DecisionBackend>,
    fallback: HeuristicEngine,
}

impl GenerativeEngine {
    pub fn new(backend: Arc<dyn DecisionBackend>) -> Self {
        Self {
            backend,
            fallback: HeuristicEngine::new(),
        }
    }

    fn build_prompt(context: &DecisionContext) -> Result<String> {
        let schema = serde_json::to_string_pretty(&schema_for!(DecisionPlan))?;
        let context_json = serde_json::to_string_pretty(context)?;
        Ok(format!(
            "You decide what a coding agent should work on overnight.\n\
             Study the context and reply with JSON only, matching this schema exactly:\n\n\
             {}\n\nContext:\n{}\n\n\
             Rules: at most {} decisions; agent must be one of {:?}; \
             estimated_duration_sec must be positive and fit the {}s budget; \
             rationale must cite a concrete fact from the context.",
            schema,
            context_json,
            context.max_tasks,
            context.available_agents,
            context.time_budget_secs,
        ))
    }

    fn parse_and_validate(raw: &str, context: &DecisionContext) -> Result<Vec<TaskDecision>> {
        let json = extract_json(raw)
            .ok_or_else(|| backend_err("no JSON object found in the response"))?;
        let plan: DecisionPlan = serde_json::from_str(json)
            .map_err(|e| backend_err(format!("response does not match the schema: {}", e)))?;

        if plan.decisions.is_empty() {
            return Err(backend_err("decision list is empty"));
        }
        for decision in &plan.decisions {
            if decision.task.trim().is_empty() {
                return Err(backend_err("a decision has an empty task"));
            }
            if decision.rationale.trim().is_empty() {
                return Err(backend_err("a decision has an empty rationale"));
            }
            if !context.available_agents.iter().any(|a| a == &decision.agent) {
                return Err(backend_err(format!(
                    "agent \"{}\" is not one of the available agents",
                    decision.agent
                )));
            }
            if decision.estimated_duration_sec == 0 {
                return Err(backend_err("estimated_duration_sec must be positive"));
            }
            if let Some(confidence) = decision.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(backend_err(format!(
                        "confidence {} is outside [0, 1]",
                        confidence
                    )));
                }
            }
        }

        let mut decisions = plan.decisions;
        decisions.truncate(context.max_tasks);
        Ok(decisions)
    }

    async fn attempt(&self, prompt: &str, context: &DecisionContext) -> Result<Vec<TaskDecision>> {
        let raw = self.backend.complete(prompt).await?;
        Self::parse_and_validate(&raw, context)
    }
}

#[async_trait]
impl DecisionEngine for GenerativeEngine {
    fn name(&self) -> &'static str {
        "generative"
    }

    async fn decide(&self, context: &DecisionContext) -> Result<Vec<TaskDecision>> {
        let prompt = Self::build_prompt(context)?;
        match self.attempt(&prompt, context).await {
            Ok(decisions) => Ok(decisions),
            Err(first) => {
                debug!(error = %first, "Backend response unusable; retrying once");
                let retry_prompt = format!(
                    "{}\n\nYour previous response could not be used ({}). \
                     Respond again with only JSON matching the schema.",
                    prompt, first
                );
                match self.attempt(&retry_prompt, context).await {
                    Ok(decisions) => Ok(decisions),
                    Err(second) => {
                        warn!(error = %second, "Backend failed twice; falling back to heuristic");
                        self.fallback.decide(context).await
                    }
                }
            }
        }
    }
}

fn backend_err(msg: impl std::fmt::Display) -> NightshiftError {
    NightshiftError::DecisionBackend(msg.to_string())
}

/// Slices out the outermost JSON object, tolerating prose or code fences
/// around it.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start <= end).then_some(&raw[start..=end])
}
