use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use quill_core::{current_unix_timestamp_ms, new_task_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `AgentType` values.
pub enum AgentType {
    VaultManager,
    Retrieval,
    Context,
    Planner,
    Memory,
}

impl AgentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VaultManager => "vault_manager",
            Self::Retrieval => "retrieval",
            Self::Context => "context",
            Self::Planner => "planner",
            Self::Memory => "memory",
        }
    }

    /// Parses the snake_case form produced by [`AgentType::as_str`].
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "vault_manager" | "vault-manager" => Some(Self::VaultManager),
            "retrieval" => Some(Self::Retrieval),
            "context" => Some(Self::Context),
            "planner" => Some(Self::Planner),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `TaskStatus` values.
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
/// Enumerates supported `TaskTransitionError` values.
pub enum TaskTransitionError {
    #[error("task '{task_id}' cannot transition from {from} to {to}")]
    IllegalTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A unit of work routed to the agent registered for its `agent_type`.
///
/// Identity is the `id` field: two tasks compare equal when their ids match,
/// regardless of payload or status drift between snapshots.
pub struct AgentTask {
    pub id: String,
    pub agent_type: AgentType,
    pub description: String,
    #[serde(default)]
    pub input_data: serde_json::Map<String, Value>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at_unix_ms: u64,
    #[serde(default)]
    pub completed_at_unix_ms: Option<u64>,
}

impl AgentTask {
    /// Creates a pending task, auto-assigning `id` and `created_at_unix_ms`.
    pub fn new(agent_type: AgentType, description: impl Into<String>) -> Self {
        Self {
            id: new_task_id(),
            agent_type,
            description: description.into(),
            input_data: serde_json::Map::new(),
            dependencies: BTreeSet::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at_unix_ms: current_unix_timestamp_ms(),
            completed_at_unix_ms: None,
        }
    }

    pub fn with_input(mut self, input_data: serde_json::Map<String, Value>) -> Self {
        self.input_data = input_data;
        self
    }

    pub fn with_dependencies<I>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the task as dispatched. Legal only from `Pending`.
    pub fn begin(&mut self) -> Result<(), TaskTransitionError> {
        self.transition_guard(TaskStatus::InProgress, TaskStatus::Pending)?;
        self.status = TaskStatus::InProgress;
        Ok(())
    }

    /// Records a successful result. Legal only from `InProgress`.
    pub fn complete(&mut self, result: Value) -> Result<(), TaskTransitionError> {
        self.transition_guard(TaskStatus::Completed, TaskStatus::InProgress)?;
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at_unix_ms = Some(current_unix_timestamp_ms());
        Ok(())
    }

    /// Records a fault. Legal only from `InProgress`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskTransitionError> {
        self.transition_guard(TaskStatus::Failed, TaskStatus::InProgress)?;
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.result = None;
        self.completed_at_unix_ms = Some(current_unix_timestamp_ms());
        Ok(())
    }

    /// Cancels a not-yet-dispatched task with a reason. Legal only from `Pending`.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TaskTransitionError> {
        self.transition_guard(TaskStatus::Cancelled, TaskStatus::Pending)?;
        self.status = TaskStatus::Cancelled;
        self.error = Some(reason.into());
        self.result = None;
        self.completed_at_unix_ms = Some(current_unix_timestamp_ms());
        Ok(())
    }

    fn transition_guard(
        &self,
        to: TaskStatus,
        expected_from: TaskStatus,
    ) -> Result<(), TaskTransitionError> {
        if self.status != expected_from {
            return Err(TaskTransitionError::IllegalTransition {
                task_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}

impl PartialEq for AgentTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AgentTask {}
