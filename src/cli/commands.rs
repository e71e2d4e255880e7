use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nightshift")]
#[command(author, version, about = "Unattended overnight coding-agent orchestration", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Raise log level to debug.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (default: nightshift.toml).
    #[arg(short, long, global = true, env = "NIGHTSHIFT_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a commented default configuration file
    Init,

    /// Run the scheduler until interrupted (Ctrl-C stops gracefully,
    /// a second Ctrl-C cancels active sessions)
    Start,

    /// Run exactly one wake cycle now and print its report
    Once {
        /// Skip the constraint gate for this cycle
        #[arg(long)]
        force: bool,
    },

    /// Show scheduler state, metrics and queue counts
    Status,

    /// Inspect and maintain the durable task queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
pub enum QueueAction {
    /// List queued tasks, newest first
    List {
        /// Only tasks with this status (pending, in_progress, completed,
        /// failed, cancelled)
        #[arg(long)]
        status: Option<String>,
    },

    /// Delete terminal tasks older than the retention threshold
    Cleanup {
        #[arg(long, default_value_t = 14)]
        older_than_days: u32,
    },
}
