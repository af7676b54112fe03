//! Task and message model for the Quill orchestration core.
//!
//! Pure data plus the task lifecycle state machine. No I/O happens here; the
//! orchestrator owns all status mutation and the graph validation entry
//! points reject malformed dependency sets before any dispatch.

mod graph;
mod message;
mod task;

pub use graph::{GraphValidationError, TaskGraph};
pub use message::AgentMessage;
pub use task::{AgentTask, AgentType, TaskStatus, TaskTransitionError};
