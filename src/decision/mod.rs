//! Decision engines: what should tonight's work be?
//!
//! - `context`: the per-cycle snapshot engines decide from
//! - `engine`: the `DecisionEngine` capability trait
//! - `heuristic`: deterministic rule-table engine, total by construction
//! - `generative`: external-model engine with corrective retry and
//!   heuristic fallback
//! - `backend`: the opaque request/response call to the external model
//!
//! The two engines are interchangeable behind `DecisionEngine`; fallback is
//! explicit composition (the generative engine holds a heuristic engine),
//! never inheritance-style layering.

mod backend;
mod context;
mod engine;
mod generative;
mod heuristic;

pub use backend::{CommandBackend, DecisionBackend};
pub use context::{DecisionContext, RepoStatus, SessionInsights};
pub use engine::DecisionEngine;
pub use generative::GenerativeEngine;
pub use heuristic::HeuristicEngine;
