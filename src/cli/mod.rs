//! Command-line surface.
//!
//! - `commands`: clap argument structs
//! - `display`: plain-text rendering of status, queue and cycle reports

mod commands;
mod display;

pub use commands::{Cli, Commands, QueueAction};
pub use display::Display;
