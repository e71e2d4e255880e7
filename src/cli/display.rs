use chrono::{DateTime, Utc};

use crate::orchestrator::CycleReport;
use crate::queue::{OvernightTask, QueueCounts};
use crate::scheduler::{SchedulerState, StatusSnapshot};

/// Plain-text rendering for the CLI. Everything here writes to stdout
/// except `print_error`.
pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("error: {}", message);
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", text);
        println!("{}", "=".repeat(text.len().max(24)));
    }

    pub fn print_status(&self, snapshot: Option<&StatusSnapshot>, counts: &QueueCounts) {
        self.print_header("nightshift status");
        match snapshot {
            Some(snapshot) => {
                self.print_state(&snapshot.state);
                let m = &snapshot.metrics;
                println!("  cycles run:        {}", m.cycle_count);
                println!("  missed wakes:      {}", m.missed_wakes);
                println!("  constraint pauses: {}", m.constraint_pauses);
                if m.consecutive_failures > 0 {
                    println!("  consecutive fails: {}", m.consecutive_failures);
                }
                println!("  last run:          {}", fmt_opt_time(m.last_run_time));
                println!("  next wake:         {}", fmt_opt_time(m.next_wake_time));
                if let Some(error) = &m.last_cycle_error {
                    println!("  last cycle error:  {}", error);
                }
                println!("  written at:        {}", fmt_time(snapshot.written_at));
            }
            None => println!("  no scheduler state recorded yet"),
        }
        println!();
        println!(
            "  queue: {} pending, {} in progress, {} completed, {} failed, {} cancelled",
            counts.pending, counts.in_progress, counts.completed, counts.failed, counts.cancelled
        );
    }

    fn print_state(&self, state: &SchedulerState) {
        match state {
            SchedulerState::Running { next_wake } => {
                println!("  state:             running (next wake {})", fmt_time(*next_wake));
            }
            SchedulerState::Paused { reason } => {
                println!("  state:             paused ({})", reason);
            }
            other => println!("  state:             {}", other),
        }
    }

    pub fn print_tasks(&self, tasks: &[OvernightTask]) {
        if tasks.is_empty() {
            println!("no matching tasks");
            return;
        }
        for task in tasks {
            println!(
                "{}  [{}] {} ({})",
                &task.id[..8.min(task.id.len())],
                task.status,
                task.decision.task,
                task.decision.agent,
            );
            println!("          why: {}", task.decision.rationale);
            if let Some(error) = &task.error {
                println!("          error: {}", error);
            }
        }
        println!("{} task(s)", tasks.len());
    }

    pub fn print_report(&self, report: &CycleReport) {
        self.print_header("cycle report");
        println!("  engine:    {}", report.engine);
        println!("  decided:   {}", report.decided);
        println!("  enqueued:  {} (deduplicated {})", report.enqueued, report.deduped);
        println!("  completed: {}", report.completed);
        println!("  failed:    {}", report.failed);
        println!("  cancelled: {}", report.cancelled);
        println!("  duration:  {}s", report.duration_secs);
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn fmt_opt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(fmt_time).unwrap_or_else(|| String::from("never"))
}
