use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use quill_collaborator::{CollaboratorGuard, GuardPolicy, RetrievalEngine};
use quill_task::{AgentMessage, AgentTask, AgentType};

use crate::contract::{decode_operation, Agent, AgentCapability, AgentError};

const SUPPORTED_OPERATIONS: &[&str] = &["build_context", "answer_with_context"];

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum ContextOperation {
    BuildContext {
        query: String,
        #[serde(default = "default_context_limit")]
        limit: usize,
    },
    AnswerWithContext {
        query: String,
    },
}

fn default_context_limit() -> usize {
    5
}

/// Agent that assembles grounding context from retrieved documents.
///
/// Shares the retrieval engine collaborator with [`crate::RetrievalAgent`]
/// but exposes context-shaped capabilities: a concatenated context block
/// with source attribution, and context-grounded answering.
pub struct ContextAgent {
    engine: Arc<dyn RetrievalEngine>,
    guard: CollaboratorGuard,
}

impl ContextAgent {
    pub fn new(engine: Arc<dyn RetrievalEngine>) -> Self {
        Self::with_policy(engine, GuardPolicy::default())
    }

    pub fn with_policy(engine: Arc<dyn RetrievalEngine>, policy: GuardPolicy) -> Self {
        Self {
            engine,
            guard: CollaboratorGuard::new(policy),
        }
    }

    pub fn capabilities() -> Vec<AgentCapability> {
        vec![
            AgentCapability::new(
                "build_context",
                "Assemble a context block from the top-ranked documents for a query",
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
                    "properties": {
                        "context": { "type": "string" },
                        "sources": { "type": "array", "items": { "type": "string" } }
                    }
                }),
            ),
            AgentCapability::new(
                "answer_with_context",
                "Answer a query grounded in retrieved context",
                json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                }),
                json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } }
                }),
            ),
        ]
    }
}

#[async_trait]
impl Agent for ContextAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Context
    }

    async fn initialize(&self) -> Result<Vec<AgentCapability>, AgentError> {
        self.engine
            .search("", 1)
            .await
            .map_err(|error| AgentError::Initialization(error.to_string()))?;
        Ok(Self::capabilities())
    }

    async fn execute_task(&self, task: &AgentTask) -> Result<Value, AgentError> {
        let operation: ContextOperation =
            decode_operation(self.agent_type(), task, SUPPORTED_OPERATIONS)?;
        match operation {
            ContextOperation::BuildContext { query, limit } => {
                let documents = self
                    .guard
                    .run("context.build_context", || self.engine.search(&query, limit))
                    .await?;
                let sources: Vec<&str> = documents
                    .iter()
                    .map(|document| document.id.as_str())
                    .collect();
                let context = documents
                    .iter()
                    .map(|document| format!("[{}] {}", document.id, document.content))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                Ok(json!({ "query": query, "context": context, "sources": sources }))
            }
            ContextOperation::AnswerWithContext { query } => {
                let text = self
                    .guard
                    .run("context.answer_with_context", || {
                        self.engine.generate(&query, true)
                    })
                    .await?;
                Ok(json!({ "query": query, "text": text }))
            }
        }
    }

    async fn handle_message(&self, message: &AgentMessage) -> Result<(), AgentError> {
        debug!(message_id = %message.id, from = %message.from_agent, "context agent received message");
        Ok(())
    }
}
