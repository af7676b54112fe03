//! Dispatch and dependency engine for Quill goals.
//!
//! A single coordinating loop owns the task table, ready bookkeeping, and
//! result map; agent workers send mutation requests (completions) back over
//! one channel. This single-writer discipline is what guarantees at-most-once
//! dispatch per task id and keeps the graph free of fine-grained locking.

mod coordinator;
mod events;
mod status;

pub use coordinator::{
    GoalReport, Orchestrator, OrchestratorBuilder, OrchestratorConfig, OrchestratorError,
    TaskReport,
};
pub use events::{read_dispatch_events, DispatchEvent, DispatchEventLog};
pub use status::{AgentStatus, OrchestratorStatus};
