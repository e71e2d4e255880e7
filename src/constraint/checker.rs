use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use super::probes::{HostProbe, SystemProbe};
use crate::config::ConstraintsConfig;
use crate::error::{NightshiftError, Result};

/// Per-probe deadline. A probe that hangs past this is treated as a probe
/// failure under the same open/closed policy as an erroring probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Keyboard or mouse input within this window counts as an active user.
const USER_IDLE_THRESHOLD_SECS: u64 = 300;

/// Evaluates the configured environmental constraints before any work is
/// allowed to start.
///
/// Constraints run in declaration order and the first unsatisfied one wins.
/// Probe failures fall back by constraint class: power and network fail
/// closed (a laptop on battery must never be drained by mistake) while CPU,
/// DND and user-activity probes fail open.
pub struct ConstraintGate {
    config: ConstraintsConfig,
    probe: Arc<dyn SystemProbe>,
}

impl ConstraintGate {
    pub fn new(config: ConstraintsConfig) -> Self {
        Self::with_probe(config, Arc::new(HostProbe))
    }

    pub fn with_probe(config: ConstraintsConfig, probe: Arc<dyn SystemProbe>) -> Self {
        Self { config, probe }
    }

    pub fn any_enabled(&self) -> bool {
        self.config.any_enabled()
    }

    /// Ok when every enabled constraint is satisfied; otherwise the error
    /// names the first constraint that blocked the run.
    pub async fn check_all(&self) -> Result<()> {
        if self.config.plugged_in {
            match self.probed("plugged_in", self.probe.on_ac_power()).await {
                Ok(true) => {}
                Ok(false) => return Err(unsatisfied("plugged_in")),
                Err(e) => {
                    warn!(error = %e, "Power probe failed; treating plugged_in as unsatisfied");
                    return Err(unsatisfied("plugged_in"));
                }
            }
        }

        if self.config.wifi_only {
            match self.probed("wifi_only", self.probe.on_wifi()).await {
                Ok(true) => {}
                Ok(false) => return Err(unsatisfied("wifi_only")),
                Err(e) => {
                    warn!(error = %e, "Network probe failed; treating wifi_only as unsatisfied");
                    return Err(unsatisfied("wifi_only"));
                }
            }
        }

        if let Some(max) = self.config.cpu_max_percentage {
            match self
                .probed("cpu_max_percentage", self.probe.cpu_usage_percent())
                .await
            {
                Ok(usage) if usage > max => {
                    debug!(usage, max, "CPU busier than the configured ceiling");
                    return Err(unsatisfied("cpu_max_percentage"));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "CPU probe failed; treating cpu_max_percentage as satisfied");
                }
            }
        }

        if self.config.respect_dnd {
            match self.probed("respect_dnd", self.probe.do_not_disturb()).await {
                Ok(true) => return Err(unsatisfied("respect_dnd")),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "DND probe failed; treating respect_dnd as satisfied");
                }
            }
        }

        if self.config.suspend_if_active {
            match self
                .probed("suspend_if_active", self.probe.seconds_since_user_input())
                .await
            {
                Ok(idle) if idle < USER_IDLE_THRESHOLD_SECS => {
                    debug!(idle_secs = idle, "User input seen recently");
                    return Err(unsatisfied("suspend_if_active"));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Idle probe failed; treating suspend_if_active as satisfied");
                }
            }
        }

        Ok(())
    }

    async fn probed<T>(&self, name: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(PROBE_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(NightshiftError::Other(format!("{} probe timed out", name))),
        }
    }
}

fn unsatisfied(name: &str) -> NightshiftError {
    NightshiftError::ConstraintUnsatisfied {
        reason: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted probe: `None` simulates a probe failure.
    struct FakeProbe {
        ac: Option<bool>,
        wifi: Option<bool>,
        cpu: Option<u8>,
        dnd: Option<bool>,
        idle_secs: Option<u64>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeProbe {
        fn healthy() -> Self {
            Self {
                ac: Some(true),
                wifi: Some(true),
                cpu: Some(10),
                dnd: Some(false),
                idle_secs: Some(3600),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn value<T: Copy>(&self, name: &'static str, v: Option<T>) -> Result<T> {
            self.calls.lock().push(name);
            v.ok_or_else(|| NightshiftError::Other(format!("{} unavailable", name)))
        }
    }

    #[async_trait]
    impl SystemProbe for FakeProbe {
        async fn on_ac_power(&self) -> Result<bool> {
            self.value("power", self.ac)
        }
        async fn on_wifi(&self) -> Result<bool> {
            self.value("wifi", self.wifi)
        }
        async fn cpu_usage_percent(&self) -> Result<u8> {
            self.value("cpu", self.cpu)
        }
        async fn do_not_disturb(&self) -> Result<bool> {
            self.value("dnd", self.dnd)
        }
        async fn seconds_since_user_input(&self) -> Result<u64> {
            self.value("idle", self.idle_secs)
        }
    }

    fn all_enabled() -> ConstraintsConfig {
        ConstraintsConfig {
            plugged_in: true,
            wifi_only: true,
            cpu_max_percentage: Some(50),
            respect_dnd: true,
            suspend_if_active: true,
        }
    }

    fn gate(config: ConstraintsConfig, probe: FakeProbe) -> ConstraintGate {
        ConstraintGate::with_probe(config, Arc::new(probe))
    }

    #[tokio::test]
    async fn test_disabled_constraints_never_probe() {
        let probe = FakeProbe {
            ac: None,
            wifi: None,
            cpu: None,
            dnd: None,
            idle_secs: None,
            calls: Mutex::new(Vec::new()),
        };
        let gate = gate(ConstraintsConfig::default(), probe);
        assert!(gate.check_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_all_satisfied_passes() {
        let gate = gate(all_enabled(), FakeProbe::healthy());
        assert!(gate.check_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_on_battery_blocks_with_named_reason() {
        let probe = FakeProbe {
            ac: Some(false),
            ..FakeProbe::healthy()
        };
        let err = gate(all_enabled(), probe).check_all().await.unwrap_err();
        assert_eq!(err.to_string(), "plugged_in constraint not satisfied");
    }

    #[tokio::test]
    async fn test_power_probe_failure_fails_closed() {
        let probe = FakeProbe {
            ac: None,
            ..FakeProbe::healthy()
        };
        let err = gate(all_enabled(), probe).check_all().await.unwrap_err();
        assert!(matches!(
            err,
            NightshiftError::ConstraintUnsatisfied { reason } if reason == "plugged_in"
        ));
    }

    #[tokio::test]
    async fn test_wired_network_blocks_when_wifi_required() {
        let probe = FakeProbe {
            wifi: Some(false),
            ..FakeProbe::healthy()
        };
        let err = gate(all_enabled(), probe).check_all().await.unwrap_err();
        assert_eq!(err.to_string(), "wifi_only constraint not satisfied");
    }

    #[tokio::test]
    async fn test_cpu_over_ceiling_blocks() {
        let probe = FakeProbe {
            cpu: Some(90),
            ..FakeProbe::healthy()
        };
        let err = gate(all_enabled(), probe).check_all().await.unwrap_err();
        assert_eq!(err.to_string(), "cpu_max_percentage constraint not satisfied");
    }

    #[tokio::test]
    async fn test_cpu_probe_failure_fails_open() {
        let probe = FakeProbe {
            cpu: None,
            ..FakeProbe::healthy()
        };
        assert!(gate(all_enabled(), probe).check_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_dnd_active_blocks_and_probe_failure_fails_open() {
        let active = FakeProbe {
            dnd: Some(true),
            ..FakeProbe::healthy()
        };
        let err = gate(all_enabled(), active).check_all().await.unwrap_err();
        assert_eq!(err.to_string(), "respect_dnd constraint not satisfied");

        let broken = FakeProbe {
            dnd: None,
            ..FakeProbe::healthy()
        };
        assert!(gate(all_enabled(), broken).check_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_recent_user_input_blocks() {
        let probe = FakeProbe {
            idle_secs: Some(30),
            ..FakeProbe::healthy()
        };
        let err = gate(all_enabled(), probe).check_all().await.unwrap_err();
        assert_eq!(err.to_string(), "suspend_if_active constraint not satisfied");
    }

    #[tokio::test]
    async fn test_first_unsatisfied_short_circuits() {
        let probe = Arc::new(FakeProbe {
            ac: Some(false),
            ..FakeProbe::healthy()
        });
        let gate = ConstraintGate::with_probe(all_enabled(), probe.clone());
        assert!(gate.check_all().await.is_err());
        // Only the power probe ran; later probes were never consulted.
        assert_eq!(*probe.calls.lock(), vec!["power"]);
    }

    struct HangingProbe;

    #[async_trait]
    impl SystemProbe for HangingProbe {
        async fn on_ac_power(&self) -> Result<bool> {
            std::future::pending().await
        }
        async fn on_wifi(&self) -> Result<bool> {
            Ok(true)
        }
        async fn cpu_usage_percent(&self) -> Result<u8> {
            Ok(0)
        }
        async fn do_not_disturb(&self) -> Result<bool> {
            Ok(false)
        }
        async fn seconds_since_user_input(&self) -> Result<u64> {
            Ok(3600)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_power_probe_times_out_closed() {
        let config = ConstraintsConfig {
            plugged_in: true,
            ..ConstraintsConfig::default()
        };
        let gate = ConstraintGate::with_probe(config, Arc::new(HangingProbe));
        let err = gate.check_all().await.unwrap_err();
        assert_eq!(err.to_string(), "plugged_in constraint not satisfied");
    }
}
