//! nightshift: unattended overnight orchestration of coding agents.
//!
//! A timer-driven loop wakes on a cron-style schedule, gates each wake on
//! live system constraints, asks a pluggable decision engine what work is
//! worth doing, records that work in a durable deduplicating queue, and
//! delegates it to coding-agent capabilities under per-session time
//! budgets and a hard concurrency cap.

pub mod agent;
pub mod cli;
pub mod config;
pub mod constraint;
pub mod decision;
pub mod error;
pub mod git;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;

pub use agent::{AgentCoordinator, AgentProvider, AgentSessionResult, SessionState};
pub use config::OrchestrationConfig;
pub use constraint::ConstraintGate;
pub use decision::{DecisionContext, DecisionEngine, GenerativeEngine, HeuristicEngine};
pub use error::{NightshiftError, Result};
pub use orchestrator::{CycleReport, Orchestrator};
pub use queue::{OvernightTask, TaskDecision, TaskPriority, TaskQueue, TaskStatus};
pub use scheduler::{SchedulerService, SchedulerState};
