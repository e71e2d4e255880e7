//! Durable task queue.
//!
//! - `task`: task model, priorities, lifecycle transitions, dedup hashing
//! - `store`: SQLite persistence with a single writer thread and read pool
//! - `events`: change events broadcast to queue subscribers
//!
//! Every decision accepted by the orchestrator becomes exactly one queue
//! row. Work that is semantically identical to a live (pending or
//! in_progress) task is deduplicated by content hash rather than enqueued
//! twice, and lifecycle transitions outside the allowed graph are rejected
//! at the storage layer.

mod events;
mod store;
mod task;

pub use events::QueueEvent;
pub use store::TaskQueue;
pub use task::{
    OvernightTask, QueueCounts, TaskDecision, TaskFilter, TaskPriority, TaskStatus,
};
