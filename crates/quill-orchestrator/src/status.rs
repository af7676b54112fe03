use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use quill_core::{current_unix_timestamp_ms, write_text_atomic};
use quill_task::AgentType;

const STATUS_SNAPSHOT_SCHEMA_VERSION: u32 = 1;

fn status_snapshot_schema_version() -> u32 {
    STATUS_SNAPSHOT_SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Health snapshot for one registered agent.
pub struct AgentStatus {
    pub agent_type: AgentType,
    pub running: bool,
    pub active_tasks: usize,
    pub queue_depth: usize,
    pub dropped_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Per-agent health snapshot returned by `get_status`.
///
/// Used for external health checks, never for control decisions.
pub struct OrchestratorStatus {
    #[serde(default = "status_snapshot_schema_version")]
    pub schema_version: u32,
    pub agents: Vec<AgentStatus>,
    pub pending_tasks: usize,
    pub in_progress_tasks: usize,
    pub active_goals: usize,
    pub captured_at_unix_ms: u64,
}

impl OrchestratorStatus {
    pub fn new(
        agents: Vec<AgentStatus>,
        pending_tasks: usize,
        in_progress_tasks: usize,
        active_goals: usize,
    ) -> Self {
        Self {
            schema_version: STATUS_SNAPSHOT_SCHEMA_VERSION,
            agents,
            pending_tasks,
            in_progress_tasks,
            active_goals,
            captured_at_unix_ms: current_unix_timestamp_ms(),
        }
    }

    /// Atomically replaces the on-disk snapshot for external health checks.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let rendered =
            serde_json::to_string_pretty(self).context("serialize orchestrator status")?;
        write_text_atomic(path, &rendered)
            .with_context(|| format!("failed to persist status snapshot {}", path.display()))
    }
}
