use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{NightshiftError, Result};
use crate::scheduler::CronExpr;

pub const DEFAULT_CONFIG_TOML: &str = r#"# nightshift configuration

id = "overnight"

# Repository the agents work in. Supports ~ and ${VAR} substitution.
workspace_root = "~/work/project"

# Durable state (task queue, metrics). Empty = <workspace_root>/.nightshift
state_dir = ""

# Wall-clock allowance per cycle, seconds (900-7200).
time_budget_sec = 3600

# Parallel agent sessions (1-4).
max_concurrent = 1

goals = []
agent_preferences = []
focus = []

[schedule]
expression = "*/30 1-5 * * *"
window_start = "01:00"
window_end = "05:00"
jitter_ms = 120000
# "skip" or "run_once_at_next_opportunity"
on_missed = "skip"

[constraints]
plugged_in = true
wifi_only = false
# cpu_max_percentage = 60
respect_dnd = false
suspend_if_active = false

[decision]
# "heuristic" or "generative"
backend = "heuristic"
command = ""
timeout_sec = 60

# [agents.implementer]
# command = "agent-cli"
# args = ["run", "--prompt", "{prompt}"]

[notify]
event_log = true
# hook_command = "notify-hook.sh"
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub id: String,
    pub workspace_root: String,
    pub state_dir: String,
    /// Wall-clock allowance per cycle, seconds. Enforced range 900-7200.
    pub time_budget_sec: u64,
    /// Simultaneous agent sessions. Enforced range 1-4.
    pub max_concurrent: usize,
    pub goals: Vec<String>,
    pub agent_preferences: Vec<String>,
    pub focus: Vec<String>,
    pub schedule: ScheduleConfig,
    pub constraints: ConstraintsConfig,
    pub decision: DecisionConfig,
    pub agents: BTreeMap<String, AgentCommandConfig>,
    pub notify: NotifyConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            id: String::from("overnight"),
            workspace_root: String::from("."),
            state_dir: String::new(),
            time_budget_sec: 3600,
            max_concurrent: 1,
            goals: Vec::new(),
            agent_preferences: Vec::new(),
            focus: Vec::new(),
            schedule: ScheduleConfig::default(),
            constraints: ConstraintsConfig::default(),
            decision: DecisionConfig::default(),
            agents: BTreeMap::new(),
            notify: NotifyConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            NightshiftError::Validation(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| NightshiftError::Validation(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate every field eagerly; wake-time code never re-validates.
    /// All violations are collected into a single error.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push(String::from("id must not be empty"));
        }
        if self.workspace_root.trim().is_empty() {
            errors.push(String::from("workspace_root must not be empty"));
        }
        if !(900..=7200).contains(&self.time_budget_sec) {
            errors.push(String::from(
                "time_budget_sec must be between 900 and 7200",
            ));
        }
        if !(1..=4).contains(&self.max_concurrent) {
            errors.push(String::from("max_concurrent must be between 1 and 4"));
        }

        if let Err(e) = CronExpr::parse(&self.schedule.expression) {
            errors.push(format!("schedule.expression: {}", e));
        }
        match self.schedule.window() {
            Ok((start, end)) if start == end => {
                errors.push(String::from(
                    "schedule window must not be empty (start == end)",
                ));
            }
            Ok(_) => {}
            Err(e) => errors.push(e.to_string()),
        }
        if self.schedule.jitter_ms > 3_600_000 {
            errors.push(String::from("schedule.jitter_ms must be at most 3600000"));
        }

        if let Some(pct) = self.constraints.cpu_max_percentage {
            if pct == 0 || pct > 100 {
                errors.push(String::from(
                    "constraints.cpu_max_percentage must be between 1 and 100",
                ));
            }
        }

        if self.decision.timeout_sec == 0 {
            errors.push(String::from("decision.timeout_sec must be greater than 0"));
        }
        if self.decision.backend == DecisionBackendKind::Generative
            && self.decision.command.trim().is_empty()
        {
            errors.push(String::from(
                "decision.command is required when decision.backend is \"generative\"",
            ));
        }

        for (id, agent) in &self.agents {
            if agent.command.trim().is_empty() {
                errors.push(format!("agents.{}.command must not be empty", id));
            }
        }
        for pref in &self.agent_preferences {
            if !self.agents.is_empty() && !self.agents.contains_key(pref) {
                errors.push(format!(
                    "agent_preferences entry \"{}\" has no [agents.{}] section",
                    pref, pref
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NightshiftError::Validation(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    pub fn workspace(&self) -> PathBuf {
        expand_path(&self.workspace_root)
    }

    pub fn state_dir(&self) -> PathBuf {
        if self.state_dir.trim().is_empty() {
            self.workspace().join(".nightshift")
        } else {
            expand_path(&self.state_dir)
        }
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_sec)
    }

    /// Configured agent ids in stable (sorted) order.
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// 5-field cron expression (minute hour day month weekday).
    pub expression: String,
    /// Window start, "HH:MM". The window [start, end) may cross midnight.
    pub window_start: String,
    pub window_end: String,
    /// Upper bound of the uniform random delay added to each wake.
    pub jitter_ms: u64,
    pub on_missed: MissedWakePolicy,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            expression: String::from("*/30 1-5 * * *"),
            window_start: String::from("01:00"),
            window_end: String::from("05:00"),
            jitter_ms: 120_000,
            on_missed: MissedWakePolicy::Skip,
        }
    }
}

impl ScheduleConfig {
    pub fn window(&self) -> Result<(NaiveTime, NaiveTime)> {
        let start = parse_window_time("schedule.window_start", &self.window_start)?;
        let end = parse_window_time("schedule.window_end", &self.window_end)?;
        Ok((start, end))
    }
}

fn parse_window_time(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
        NightshiftError::Validation(format!("{} must be HH:MM, got \"{}\"", field, value))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedWakePolicy {
    Skip,
    RunOnceAtNextOpportunity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintsConfig {
    pub plugged_in: bool,
    pub wifi_only: bool,
    pub cpu_max_percentage: Option<u8>,
    pub respect_dnd: bool,
    pub suspend_if_active: bool,
}

impl ConstraintsConfig {
    pub fn any_enabled(&self) -> bool {
        self.plugged_in
            || self.wifi_only
            || self.cpu_max_percentage.is_some()
            || self.respect_dnd
            || self.suspend_if_active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionBackendKind {
    Heuristic,
    Generative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub backend: DecisionBackendKind,
    /// Program invoked by the generative backend.
    pub command: String,
    pub timeout_sec: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            backend: DecisionBackendKind::Heuristic,
            command: String::new(),
            timeout_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCommandConfig {
    pub command: String,
    /// Argument template; "{prompt}" is replaced with the task text.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub event_log: bool,
    pub hook_command: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            event_log: true,
            hook_command: None,
        }
    }
}

/// Expand a leading `~` and any `${VAR}` references against the environment.
/// Unknown variables expand to the empty string.
fn expand_path(raw: &str) -> PathBuf {
    let mut s = raw.trim().to_string();
    if s == "~" || s.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            s = format!("{}{}", home, &s[1..]);
        }
    }
    while let Some(open) = s.find("${") {
        let Some(close_rel) = s[open..].find('}') else {
            break;
        };
        let close = open + close_rel;
        let var = &s[open + 2..close];
        let value = std::env::var(var).unwrap_or_default();
        s = format!("{}{}{}", &s[..open], value, &s[close + 1..]);
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> OrchestrationConfig {
        OrchestrationConfig {
            workspace_root: String::from("/tmp/work"),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn default_template_parses_and_validates() {
        let config = OrchestrationConfig::from_toml_str(DEFAULT_CONFIG_TOML)
            .expect("default template must validate");
        assert_eq!(config.id, "overnight");
        assert_eq!(config.schedule.on_missed, MissedWakePolicy::Skip);
        assert!(config.constraints.plugged_in);
    }

    #[test]
    fn budget_range_is_enforced() {
        let mut config = valid_config();
        config.time_budget_sec = 899;
        assert!(config.validate().is_err());
        config.time_budget_sec = 7201;
        assert!(config.validate().is_err());
        config.time_budget_sec = 900;
        assert!(config.validate().is_ok());
        config.time_budget_sec = 7200;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn concurrency_range_is_enforced() {
        let mut config = valid_config();
        config.max_concurrent = 0;
        assert!(config.validate().is_err());
        config.max_concurrent = 5;
        assert!(config.validate().is_err());
        config.max_concurrent = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_cron_and_window_are_rejected_together() {
        let mut config = valid_config();
        config.schedule.expression = String::from("not a cron");
        config.schedule.window_start = String::from("25:00");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("schedule.expression"));
        assert!(err.contains("window_start"));
    }

    #[test]
    fn empty_window_is_rejected() {
        let mut config = valid_config();
        config.schedule.window_start = String::from("02:00");
        config.schedule.window_end = String::from("02:00");
        assert!(config.validate().is_err());
    }

    #[test]
    fn generative_backend_requires_command() {
        let mut config = valid_config();
        config.decision.backend = DecisionBackendKind::Generative;
        assert!(config.validate().is_err());
        config.decision.command = String::from("decide-cli");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_agent_preference_is_rejected() {
        let mut config = valid_config();
        config.agents.insert(
            String::from("implementer"),
            AgentCommandConfig {
                command: String::from("agent-cli"),
                args: vec![String::from("{prompt}")],
            },
        );
        config.agent_preferences = vec![String::from("reviewer")];
        assert!(config.validate().is_err());
        config.agent_preferences = vec![String::from("implementer")];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn state_dir_defaults_under_workspace() {
        let config = valid_config();
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/work/.nightshift"));
    }

    #[test]
    fn env_vars_are_expanded() {
        std::env::set_var("NIGHTSHIFT_TEST_ROOT", "/srv/builds");
        let expanded = expand_path("${NIGHTSHIFT_TEST_ROOT}/repo");
        assert_eq!(expanded, PathBuf::from("/srv/builds/repo"));
    }
}
