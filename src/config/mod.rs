//! Configuration types and loading.
//!
//! - `OrchestrationConfig`: top-level configuration with eager validation
//! - `ScheduleConfig`, `ConstraintsConfig`: wake cadence and gating
//! - `DecisionConfig`, `AgentCommandConfig`, `NotifyConfig`: pluggable surfaces

mod settings;

pub use settings::{
    AgentCommandConfig, ConstraintsConfig, DecisionBackendKind, DecisionConfig, MissedWakePolicy,
    NotifyConfig, OrchestrationConfig, ScheduleConfig, DEFAULT_CONFIG_TOML,
};
