//! The standard wake cycle.
//!
//! - `engine`: the orchestrator wired between scheduler, decision engine,
//!   queue and coordinator
//! - `report`: per-cycle outcome summary
//!
//! One cycle is decide → enqueue (deduplicated) → drain pending →
//! delegate → record outcomes. The orchestrator implements the
//! scheduler's [`WakeHandler`](crate::scheduler::WakeHandler), so a cycle
//! error is recorded by the loop and never stops it.

mod engine;
mod report;

pub use engine::Orchestrator;
pub use report::CycleReport;
