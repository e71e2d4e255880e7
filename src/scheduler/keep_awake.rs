use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Counted handle over a system sleep-inhibit assertion.
///
/// The underlying assertion is engaged when the hold count rises from
/// zero and released when it returns to zero, so overlapping cycles
/// share one assertion. Releasing happens in [`KeepAwakeHold::drop`],
/// which covers error and panic exits from a cycle.
#[derive(Clone)]
pub struct KeepAwake {
    inner: Arc<Inner>,
}

/// Active hold on the assertion. Dropping it releases the hold.
pub struct KeepAwakeHold {
    inner: Arc<Inner>,
}

struct Inner {
    holds: AtomicUsize,
    inhibitor: Mutex<Box<dyn SleepInhibitor>>,
}

impl KeepAwake {
    /// Platform-backed assertion (`caffeinate` on macOS,
    /// `systemd-inhibit` on Linux). Unsupported platforms count holds
    /// without engaging anything.
    pub fn system() -> Self {
        Self::with_inhibitor(Box::new(SystemInhibitor { child: None }))
    }

    /// Counting-only variant for tests and for `--no-keep-awake` runs.
    pub fn noop() -> Self {
        Self::with_inhibitor(Box::new(NoopInhibitor))
    }

    fn with_inhibitor(inhibitor: Box<dyn SleepInhibitor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                holds: AtomicUsize::new(0),
                inhibitor: Mutex::new(inhibitor),
            }),
        }
    }

    pub fn hold(&self) -> KeepAwakeHold {
        if self.inner.holds.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.inhibitor.lock().engage();
        }
        KeepAwakeHold {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active_holds(&self) -> usize {
        self.inner.holds.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAwakeHold {
    fn drop(&mut self) {
        if self.inner.holds.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.inhibitor.lock().disengage();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.inhibitor.lock().disengage();
    }
}

trait SleepInhibitor: Send {
    fn engage(&mut self);
    fn disengage(&mut self);
}

struct NoopInhibitor;

impl SleepInhibitor for NoopInhibitor {
    fn engage(&mut self) {}
    fn disengage(&mut self) {}
}

/// Keeps a helper process alive for the duration of the assertion and
/// kills it on release. A failed spawn logs a warning and the cycle
/// runs without sleep protection.
struct SystemInhibitor {
    child: Option<std::process::Child>,
}

impl SleepInhibitor for SystemInhibitor {
    fn engage(&mut self) {
        if self.child.is_some() {
            return;
        }

        #[cfg(target_os = "macos")]
        {
            let result = std::process::Command::new("caffeinate")
                .arg("-i")
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn();
            match result {
                Ok(child) => {
                    debug!(pid = child.id(), "keep-awake assertion engaged");
                    self.child = Some(child);
                }
                Err(e) => warn!(error = %e, "cannot engage keep-awake assertion"),
            }
        }

        #[cfg(target_os = "linux")]
        {
            let result = std::process::Command::new("systemd-inhibit")
                .args([
                    "--what=sleep:idle",
                    "--who=nightshift",
                    "--why=overnight work cycle",
                    "sleep",
                    "infinity",
                ])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn();
            match result {
                Ok(child) => {
                    debug!(pid = child.id(), "keep-awake assertion engaged");
                    self.child = Some(child);
                }
                Err(e) => warn!(error = %e, "cannot engage keep-awake assertion"),
            }
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            debug!("keep-awake assertion not supported on this platform");
        }
    }

    fn disengage(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "keep-awake helper already exited");
            }
            let _ = child.wait();
            debug!("keep-awake assertion released");
        }
    }
}
