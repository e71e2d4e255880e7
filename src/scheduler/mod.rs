//! Periodic wake scheduling.
//!
//! - `cron`: 5-field cron expression parsing and next-instant search
//! - `wake`: wake planning (window clamp, jitter, missed-wake policy)
//! - `keep_awake`: counted sleep-inhibit assertion held during cycles
//! - `service`: the wake loop itself, its lifecycle state and metrics
//!
//! All schedule arithmetic is in UTC. The loop plans one wake at a time:
//! sleep to the next planned instant, apply the catch-up policy if the
//! process comes back late, hold the cycle until system constraints are
//! satisfied, then hand control to the registered wake handler. Nothing
//! a cycle does can stall or kill the loop.

mod cron;
mod keep_awake;
mod service;
mod wake;

pub use cron::CronExpr;
pub use keep_awake::{KeepAwake, KeepAwakeHold};
pub use service::{
    load_status, SchedulerMetrics, SchedulerService, SchedulerState, StatusSnapshot, WakeHandler,
    STATUS_FILE,
};
pub use wake::WakePlanner;
