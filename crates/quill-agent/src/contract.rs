use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use quill_collaborator::CollaboratorError;
use quill_task::{AgentMessage, AgentTask, AgentType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A named, schema-described operation an agent can perform.
///
/// Capabilities are declared once at `initialize()` and read-only afterwards;
/// the planner and the RPC surface consume the union of every registered
/// agent's capabilities.
pub struct AgentCapability {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
}

impl AgentCapability {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        output_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema,
        }
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `AgentError` values.
pub enum AgentError {
    #[error("agent initialization failed: {0}")]
    Initialization(String),
    #[error("agent '{agent_type}' does not support operation '{operation}'")]
    UnsupportedOperation {
        agent_type: AgentType,
        operation: String,
    },
    #[error("invalid task input: {0}")]
    InvalidInput(String),
    #[error("collaborator call failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("agent worker for '{0}' is not running")]
    NotRunning(AgentType),
}

/// The capability contract every worker agent implements.
///
/// `execute_task` is the sole entry point for work and must not mutate task
/// status itself; the orchestrator's coordinating loop owns all status
/// mutation and converts the returned result or error into the terminal
/// transition.
#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_type(&self) -> AgentType;

    /// Probes the agent's external collaborator and declares capabilities.
    ///
    /// A failed initialization marks the agent unavailable; the orchestrator
    /// removes its capabilities from the routing table and keeps running.
    async fn initialize(&self) -> Result<Vec<AgentCapability>, AgentError>;

    /// Executes one task and returns its result payload.
    async fn execute_task(&self, task: &AgentTask) -> Result<Value, AgentError>;

    /// Handles one inter-agent notification. Runs on the same loop as task
    /// execution for this agent, bounded by the worker's message timeout.
    async fn handle_message(&self, message: &AgentMessage) -> Result<(), AgentError>;
}

/// Decodes the typed operation variant out of a task's `input_data`.
///
/// The `operation` field selects the variant; unknown names are rejected
/// against `supported` before deserialization so callers get a precise
/// unsupported-operation error rather than a serde message.
pub(crate) fn decode_operation<T>(
    agent_type: AgentType,
    task: &AgentTask,
    supported: &[&str],
) -> Result<T, AgentError>
where
    T: DeserializeOwned,
{
    let operation = task
        .input_data
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AgentError::InvalidInput(format!(
                "task '{}' is missing the string 'operation' field",
                task.id
            ))
        })?;
    if !supported.contains(&operation) {
        return Err(AgentError::UnsupportedOperation {
            agent_type,
            operation: operation.to_string(),
        });
    }
    serde_json::from_value(Value::Object(task.input_data.clone())).map_err(|error| {
        AgentError::InvalidInput(format!(
            "task '{}' operation '{operation}': {error}",
            task.id
        ))
    })
}
