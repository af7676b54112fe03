use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use quill_collaborator::{CollaboratorGuard, GuardPolicy, VaultStore, WriteMode};
use quill_task::{AgentMessage, AgentTask, AgentType};

use crate::contract::{decode_operation, Agent, AgentCapability, AgentError};

const SUPPORTED_OPERATIONS: &[&str] = &[
    "read_note",
    "write_note",
    "delete_note",
    "search_notes",
    "update_frontmatter",
    "update_tags",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum VaultOperation {
    ReadNote {
        path: String,
    },
    WriteNote {
        path: String,
        content: String,
        #[serde(default = "default_write_mode")]
        mode: WriteMode,
    },
    DeleteNote {
        path: String,
    },
    SearchNotes {
        query: String,
        #[serde(default = "default_search_limit")]
        limit: usize,
    },
    UpdateFrontmatter {
        path: String,
        key: String,
        value: Value,
    },
    UpdateTags {
        path: String,
        #[serde(default)]
        add: Vec<String>,
        #[serde(default)]
        remove: Vec<String>,
    },
}

fn default_write_mode() -> WriteMode {
    WriteMode::Create
}

fn default_search_limit() -> usize {
    10
}

/// Agent wrapping the note/vault storage collaborator.
pub struct VaultManagerAgent {
    store: Arc<dyn VaultStore>,
    guard: CollaboratorGuard,
}

impl VaultManagerAgent {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self::with_policy(store, GuardPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn VaultStore>, policy: GuardPolicy) -> Self {
        Self {
            store,
            guard: CollaboratorGuard::new(policy),
        }
    }

    /// Capability declarations published at initialization.
    pub fn capabilities() -> Vec<AgentCapability> {
        vec![
            AgentCapability::new(
                "read_note",
                "Read the full content of a note by vault path",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    }
                }),
            ),
            AgentCapability::new(
                "write_note",
                "Create, overwrite, or append to a note",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" },
                        "mode": { "enum": ["create", "overwrite", "append"] }
                    },
                    "required": ["path", "content"]
                }),
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } }
                }),
            ),
            AgentCapability::new(
                "delete_note",
                "Delete a note by vault path",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
                json!({
                    "type": "object",
                    "properties": { "deleted": { "type": "boolean" } }
                }),
            ),
            AgentCapability::new(
                "search_notes",
                "Full-text search over the vault",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "limit": { "type": "integer", "minimum": 1 }
                    },
                    "required": ["query"]
                }),
                json!({
                    "type": "object",
                    "properties": { "matches": { "type": "array" } }
                }),
            ),
            AgentCapability::new(
                "update_frontmatter",
                "Set one frontmatter key on a note",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "key": { "type": "string" },
                        "value": {}
                    },
                    "required": ["path", "key", "value"]
                }),
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } }
                }),
            ),
            AgentCapability::new(
                "update_tags",
                "Add and remove tags on a note",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "add": { "type": "array", "items": { "type": "string" } },
                        "remove": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["path"]
                }),
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } }
                }),
            ),
        ]
    }
}

#[async_trait]
impl Agent for VaultManagerAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::VaultManager
    }

    async fn initialize(&self) -> Result<Vec<AgentCapability>, AgentError> {
        // One cheap probe; an unreachable vault marks the agent unavailable.
        self.store
            .search("", 1)
            .await
            .map_err(|error| AgentError::Initialization(error.to_string()))?;
        Ok(Self::capabilities())
    }

    async fn execute_task(&self, task: &AgentTask) -> Result<Value, AgentError> {
        let operation: VaultOperation =
            decode_operation(self.agent_type(), task, SUPPORTED_OPERATIONS)?;
        match operation {
            VaultOperation::ReadNote { path } => {
                let content = self
                    .guard
                    .run("vault_manager.read_note", || self.store.read_note(&path))
                    .await?;
                Ok(json!({ "path": path, "content": content }))
            }
            VaultOperation::WriteNote {
                path,
                content,
                mode,
            } => {
                self.guard
                    .run("vault_manager.write_note", || {
                        self.store.write_note(&path, &content, mode)
                    })
                    .await?;
                Ok(json!({ "path": path }))
            }
            VaultOperation::DeleteNote { path } => {
                self.guard
                    .run("vault_manager.delete_note", || self.store.delete_note(&path))
                    .await?;
                Ok(json!({ "path": path, "deleted": true }))
            }
            VaultOperation::SearchNotes { query, limit } => {
                let matches = self
                    .guard
                    .run("vault_manager.search_notes", || {
                        self.store.search(&query, limit)
                    })
                    .await?;
                Ok(json!({ "query": query, "matches": matches }))
            }
            VaultOperation::UpdateFrontmatter { path, key, value } => {
                self.guard
                    .run("vault_manager.update_frontmatter", || {
                        self.store.update_frontmatter(&path, &key, value.clone())
                    })
                    .await?;
                Ok(json!({ "path": path, "key": key }))
            }
            VaultOperation::UpdateTags { path, add, remove } => {
                self.guard
                    .run("vault_manager.update_tags", || {
                        self.store.update_tags(&path, &add, &remove)
                    })
                    .await?;
                Ok(json!({ "path": path, "added": add.len(), "removed": remove.len() }))
            }
        }
    }

    async fn handle_message(&self, message: &AgentMessage) -> Result<(), AgentError> {
        debug!(message_id = %message.id, from = %message.from_agent, "vault-manager received message");
        Ok(())
    }
}
