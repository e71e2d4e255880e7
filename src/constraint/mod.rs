//! Environmental constraint gating.
//!
//! - `checker`: constraint gate evaluated before any cycle starts
//! - `probes`: host probes (power, network, CPU, DND, user activity)
//!
//! The gate never starts work on an unhealthy host; the scheduler reacts to
//! an unsatisfied constraint by pausing and retrying on a short interval
//! instead of skipping the wake outright.

mod checker;
mod probes;

pub use checker::ConstraintGate;
pub use probes::{HostProbe, SystemProbe};
