//! Cycle event notifications.
//!
//! - `events`: event kinds and payloads
//! - `notifier`: append-only event log and optional hook command
//!
//! Delivery is best effort. Failures are logged and swallowed so the
//! orchestrator never stalls on a notification path.

mod events;
mod notifier;

pub use events::{EventKind, NightEvent};
pub use notifier::Notifier;
