use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use quill_core::current_unix_timestamp_ms;

const DISPATCH_EVENT_SCHEMA_VERSION: u32 = 1;

fn dispatch_event_schema_version() -> u32 {
    DISPATCH_EVENT_SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One line of the dispatch decision log.
pub struct DispatchEvent {
    #[serde(default = "dispatch_event_schema_version")]
    pub schema_version: u32,
    pub event_kind: String,
    #[serde(default)]
    pub goal_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    pub timestamp_unix_ms: u64,
}

impl DispatchEvent {
    pub fn new(event_kind: &str) -> Self {
        Self {
            schema_version: DISPATCH_EVENT_SCHEMA_VERSION,
            event_kind: event_kind.to_string(),
            goal_id: None,
            task_id: None,
            agent_type: None,
            detail: None,
            timestamp_unix_ms: current_unix_timestamp_ms(),
        }
    }

    pub fn goal(mut self, goal_id: impl Into<String>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn agent(mut self, agent_type: impl ToString) -> Self {
        self.agent_type = Some(agent_type.to_string());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only JSONL log of dispatch decisions.
///
/// Logging is best-effort observability: append failures are reported to the
/// caller, which downgrades them to warnings rather than failing dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchEventLog {
    path: Option<PathBuf>,
}

impl DispatchEventLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, event: &DispatchEvent) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let line = serde_json::to_string(event).context("serialize dispatch event")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(())
    }
}

/// Reads every event in a dispatch log, skipping blank lines.
pub fn read_dispatch_events(path: &Path) -> Result<Vec<DispatchEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut events = Vec::new();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        let event: DispatchEvent =
            serde_json::from_str(line).context("parse dispatch event line")?;
        events.push(event);
    }
    Ok(events)
}
