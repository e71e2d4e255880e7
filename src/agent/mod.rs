//! Agent delegation.
//!
//! - `provider`: the pluggable `AgentProvider` capability and its update
//!   stream
//! - `command`: reference provider that shells out to a command-line agent
//! - `coordinator`: session admission, budgets, cancellation, monitoring
//! - `session`: session lifecycle states and results
//!
//! The engine never talks to an agent directly; every delegation runs as a
//! coordinator-owned session with a capped concurrency slot and a hard
//! wall-clock budget.

mod command;
mod coordinator;
mod provider;
mod session;

pub use command::CommandAgent;
pub use coordinator::AgentCoordinator;
pub use provider::{AgentProvider, SessionUpdate};
pub use session::{AgentSessionResult, SessionInfo, SessionState};
