use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{NightshiftError, Result};

/// Read-only view of host state consulted by the constraint gate.
///
/// Implementations must be cheap to call repeatedly; the gate probes on
/// every wake and on every paused-state retry.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// True when the machine is running on external power.
    async fn on_ac_power(&self) -> Result<bool>;

    /// True when the active network connection is Wi-Fi.
    async fn on_wifi(&self) -> Result<bool>;

    /// Current overall CPU utilisation, 0-100.
    async fn cpu_usage_percent(&self) -> Result<u8>;

    /// True when the user has Do Not Disturb (or a Focus mode) enabled.
    async fn do_not_disturb(&self) -> Result<bool>;

    /// Seconds since the last keyboard or mouse input.
    async fn seconds_since_user_input(&self) -> Result<u64>;
}

/// Probes the real host via platform tools.
pub struct HostProbe;

fn probe_err(what: &str, detail: impl std::fmt::Display) -> NightshiftError {
    NightshiftError::Other(format!("{} probe failed: {}", what, detail))
}

async fn run_probe(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .map_err(|e| probe_err(cmd, e))?;
    if !output.status.success() {
        return Err(probe_err(cmd, format!("exit status {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl SystemProbe for HostProbe {
    async fn on_ac_power(&self) -> Result<bool> {
        #[cfg(target_os = "macos")]
        {
            let out = run_probe("pmset", &["-g", "batt"]).await?;
            Ok(out.contains("AC Power"))
        }

        #[cfg(target_os = "linux")]
        {
            linux_ac_online().await
        }

        #[cfg(target_os = "windows")]
        {
            // BatteryStatus 2 is "on AC"; machines without a battery report
            // no instances at all.
            let out = run_probe(
                "powershell",
                &[
                    "-NoProfile",
                    "-Command",
                    "(Get-CimInstance -ClassName Win32_Battery).BatteryStatus",
                ],
            )
            .await?;
            let trimmed = out.trim();
            Ok(trimmed.is_empty() || trimmed == "2")
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            Err(probe_err("power", "unsupported platform"))
        }
    }

    async fn on_wifi(&self) -> Result<bool> {
        #[cfg(target_os = "macos")]
        {
            let out = run_probe("networksetup", &["-getairportnetwork", "en0"]).await?;
            Ok(!out.contains("not associated"))
        }

        #[cfg(target_os = "linux")]
        {
            let out = run_probe("nmcli", &["-t", "-f", "DEVICE,TYPE,STATE", "device"]).await?;
            Ok(parse_nmcli_wifi(&out))
        }

        #[cfg(target_os = "windows")]
        {
            let out = run_probe("netsh", &["wlan", "show", "interfaces"]).await?;
            Ok(out.lines().any(|l| {
                let l = l.trim();
                l.starts_with("State") && l.ends_with("connected")
            }))
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            Err(probe_err("network", "unsupported platform"))
        }
    }

    async fn cpu_usage_percent(&self) -> Result<u8> {
        #[cfg(target_os = "macos")]
        {
            // -l 2: the first sample covers time since boot, only the
            // second reflects current load.
            let out = run_probe("top", &["-l", "2", "-n", "0", "-s", "1"]).await?;
            parse_top_cpu_usage(&out).ok_or_else(|| probe_err("cpu", "unparseable top output"))
        }

        #[cfg(target_os = "linux")]
        {
            let first = tokio::fs::read_to_string("/proc/stat").await?;
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            let second = tokio::fs::read_to_string("/proc/stat").await?;
            cpu_percent_from_stat(&first, &second)
                .ok_or_else(|| probe_err("cpu", "unparseable /proc/stat"))
        }

        #[cfg(target_os = "windows")]
        {
            let out = run_probe(
                "powershell",
                &[
                    "-NoProfile",
                    "-Command",
                    "(Get-CimInstance -ClassName Win32_Processor | Measure-Object -Property LoadPercentage -Average).Average",
                ],
            )
            .await?;
            out.trim()
                .parse::<f64>()
                .map(|v| v.round().clamp(0.0, 100.0) as u8)
                .map_err(|e| probe_err("cpu", e))
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            Err(probe_err("cpu", "unsupported platform"))
        }
    }

    async fn do_not_disturb(&self) -> Result<bool> {
        #[cfg(target_os = "macos")]
        {
            // The menu bar Focus icon is only visible while a Focus mode is
            // active; a missing key means no Focus has ever been enabled.
            let result = Command::new("defaults")
                .args(["read", "com.apple.controlcenter", "NSStatusItem Visible FocusModes"])
                .output()
                .await
                .map_err(|e| probe_err("defaults", e))?;
            if !result.status.success() {
                return Ok(false);
            }
            Ok(String::from_utf8_lossy(&result.stdout).trim() == "1")
        }

        #[cfg(target_os = "linux")]
        {
            let out = run_probe(
                "gsettings",
                &["get", "org.gnome.desktop.notifications", "show-banners"],
            )
            .await?;
            Ok(out.trim() == "false")
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Err(probe_err("do-not-disturb", "unsupported platform"))
        }
    }

    async fn seconds_since_user_input(&self) -> Result<u64> {
        #[cfg(target_os = "macos")]
        {
            let out = run_probe("ioreg", &["-c", "IOHIDSystem", "-d", "4"]).await?;
            parse_hid_idle_seconds(&out).ok_or_else(|| probe_err("idle", "HIDIdleTime not found"))
        }

        #[cfg(target_os = "linux")]
        {
            let out = run_probe("xprintidle", &[]).await?;
            out.trim()
                .parse::<u64>()
                .map(|ms| ms / 1000)
                .map_err(|e| probe_err("idle", e))
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Err(probe_err("idle", "unsupported platform"))
        }
    }
}

#[cfg(target_os = "linux")]
async fn linux_ac_online() -> Result<bool> {
    let mut entries = tokio::fs::read_dir("/sys/class/power_supply").await?;
    let mut saw_supply = false;
    while let Some(entry) = entries.next_entry().await? {
        let type_path = entry.path().join("type");
        let Ok(kind) = tokio::fs::read_to_string(&type_path).await else {
            continue;
        };
        if kind.trim() != "Mains" {
            continue;
        }
        saw_supply = true;
        let online = tokio::fs::read_to_string(entry.path().join("online")).await?;
        if online.trim() == "1" {
            return Ok(true);
        }
    }
    // No mains supply exposed at all: a desktop, always on external power.
    Ok(!saw_supply)
}

#[cfg(any(target_os = "linux", test))]
fn parse_nmcli_wifi(output: &str) -> bool {
    output.lines().any(|line| {
        let mut parts = line.split(':');
        let _device = parts.next();
        matches!(
            (parts.next(), parts.next()),
            (Some("wifi"), Some("connected"))
        )
    })
}

#[cfg(any(target_os = "linux", test))]
fn cpu_percent_from_stat(first: &str, second: &str) -> Option<u8> {
    let (busy1, total1) = parse_stat_cpu_line(first)?;
    let (busy2, total2) = parse_stat_cpu_line(second)?;
    let total = total2.checked_sub(total1)?;
    if total == 0 {
        return Some(0);
    }
    let busy = busy2.saturating_sub(busy1);
    Some(((busy * 100) / total).min(100) as u8)
}

/// Parses the aggregate "cpu" line of /proc/stat into (busy, total) jiffies.
#[cfg(any(target_os = "linux", test))]
fn parse_stat_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some((total - idle, total))
}

#[cfg(any(target_os = "macos", test))]
fn parse_top_cpu_usage(output: &str) -> Option<u8> {
    let line = output.lines().rev().find(|l| l.contains("CPU usage"))?;
    let idle = line
        .split(',')
        .find_map(|part| part.trim().strip_suffix("% idle").map(str::trim))?;
    let idle: f64 = idle.parse().ok()?;
    Some((100.0 - idle).round().clamp(0.0, 100.0) as u8)
}

#[cfg(any(target_os = "macos", test))]
fn parse_hid_idle_seconds(output: &str) -> Option<u64> {
    let line = output.lines().find(|l| l.contains("HIDIdleTime"))?;
    let ns: u64 = line.rsplit('=').next()?.trim().parse().ok()?;
    Some(ns / 1_000_000_000)
}
