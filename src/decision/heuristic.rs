use async_trait::async_trait;

use super::context::DecisionContext;
use super::engine::DecisionEngine;
use crate::error::Result;
use crate::queue::{TaskDecision, TaskPriority};

/// A hotspot needs at least this many recent commits before it is worth a
/// dedicated refactor session.
const MOST_TOUCHED_MIN_COMMITS: u32 = 3;

/// Coverage below this triggers a test-writing task.
const COVERAGE_TARGET: f64 = 0.6;

const REFACTOR_DURATION_SECS: u64 = 2700;
const TESTS_DURATION_SECS: u64 = 1800;
const INVESTIGATE_DURATION_SECS: u64 = 1800;
const TIDY_DURATION_SECS: u64 = 900;
const EXPLORE_DURATION_SECS: u64 = 1200;

/// Deterministic rule-table engine. Total: given any context with at least
/// one available agent it produces at least one decision, and identical
/// contexts always produce identical output.
#[derive(Debug, Default)]
pub struct HeuristicEngine;

impl HeuristicEngine {
    pub fn new() -> Self {
        Self
    }

    fn refactor_intent(context: &DecisionContext) -> bool {
        context
            .focus
            .iter()
            .chain(context.goals.iter())
            .any(|s| s.to_lowercase().contains("refactor"))
    }

    fn effective_coverage(context: &DecisionContext) -> Option<f64> {
        context
            .insights
            .estimated_coverage
            .or(context.repo.test_file_ratio)
    }
}

#[async_trait]
impl DecisionEngine for HeuristicEngine {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn decide(&self, context: &DecisionContext) -> Result<Vec<TaskDecision>> {
        let agent = context.pick_agent()?.to_string();
        let budget = context.time_budget_secs.max(1);
        let mut decisions: Vec<TaskDecision> = Vec::new();

        let hotspot = context
            .repo
            .most_touched
            .first()
            .filter(|(_, count)| *count >= MOST_TOUCHED_MIN_COMMITS);
        if let Some((path, count)) = hotspot {
            if Self::refactor_intent(context) {
                decisions.push(
                    TaskDecision::new(
                        format!("Refactor {} to reduce churn-driven complexity", path),
                        &agent,
                        TaskPriority::High,
                        REFACTOR_DURATION_SECS.min(budget),
                        format!(
                            "{} changed in {} recent commits and refactoring is an explicit focus",
                            path, count
                        ),
                    )
                    .with_metadata("rule", "refactor_hotspot"),
                );
            }
        }

        if let Some(coverage) = Self::effective_coverage(context) {
            if coverage < COVERAGE_TARGET {
                let task = match context.repo.most_touched.first() {
                    Some((path, _)) => format!("Add tests covering {}", path),
                    None => String::from("Add tests for the most critical untested code paths"),
                };
                decisions.push(
                    TaskDecision::new(
                        task,
                        &agent,
                        TaskPriority::Medium,
                        TESTS_DURATION_SECS.min(budget),
                        format!(
                            "estimated coverage {:.2} is below the {:.2} target",
                            coverage, COVERAGE_TARGET
                        ),
                    )
                    .with_metadata("rule", "raise_coverage"),
                );
            }
        }

        if let Some(failure) = context.insights.recent_failures.first() {
            decisions.push(
                TaskDecision::new(
                    format!("Investigate and fix: {}", failure),
                    &agent,
                    TaskPriority::High,
                    INVESTIGATE_DURATION_SECS.min(budget),
                    format!("most recent overnight session failed: {}", failure),
                )
                .with_metadata("rule", "investigate_failure"),
            );
        }

        if context.repo.dirty {
            decisions.push(
                TaskDecision::new(
                    "Review uncommitted changes; commit, stash, or revert them",
                    &agent,
                    TaskPriority::Medium,
                    TIDY_DURATION_SECS.min(budget),
                    "the worktree has uncommitted changes left behind",
                )
                .with_metadata("rule", "tidy_worktree"),
            );
        }

        if decisions.is_empty() {
            let rationale = if context.goals.is_empty() {
                String::from("no signal stood out in the repository snapshot")
            } else {
                format!(
                    "no signal stood out; steering by goals: {}",
                    context.goals.join(", ")
                )
            };
            decisions.push(
                TaskDecision::new(
                    "Survey the codebase and implement one small high-value improvement",
                    &agent,
                    TaskPriority::Low,
                    EXPLORE_DURATION_SECS.min(budget),
                    rationale,
                )
                .with_metadata("rule", "exploratory"),
            );
        }

        decisions.truncate(context.max_tasks);
        Ok(decisions)
    }
}
