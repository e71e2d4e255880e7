//! Read-only git access.
//!
//! - `runner`: command execution wrapper around the `git` binary
//! - `inspect`: repository survey feeding the decision context
//!
//! Nothing here mutates the repository; agents own their own commits.

mod inspect;
mod runner;

pub use inspect::RepoInspector;
pub use runner::GitRunner;
