//! Agent capability contract, the per-agent worker loop, and the four
//! specialized agents (vault-manager, retrieval, context, memory).
//!
//! Each specialized agent wraps exactly one external collaborator behind a
//! [`CollaboratorGuard`](quill_collaborator::CollaboratorGuard). Faults never
//! escape the worker loop: every fault inside `execute_task` is converted
//! into a failed task outcome with the message preserved.

mod cancellation;
mod context;
mod contract;
mod memory;
mod retrieval;
mod vault_manager;
mod worker;

pub use cancellation::CancellationToken;
pub use context::ContextAgent;
pub use contract::{Agent, AgentCapability, AgentError};
pub use memory::MemoryAgent;
pub use retrieval::RetrievalAgent;
pub use vault_manager::VaultManagerAgent;
pub use worker::{
    spawn_agent_worker, AgentWorkerConfig, AgentWorkerHandle, TaskCompletion, TaskOutcome,
    DEFAULT_MESSAGE_TIMEOUT_MS, DEFAULT_TASK_TIMEOUT_MS,
};
