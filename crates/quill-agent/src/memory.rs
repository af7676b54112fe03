use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use quill_collaborator::{
    CollaboratorGuard, ConversationMessage, ConversationStore, GuardPolicy,
};
use quill_core::current_unix_timestamp_ms;
use quill_task::{AgentMessage, AgentTask, AgentType};

use crate::contract::{decode_operation, Agent, AgentCapability, AgentError};

const SUPPORTED_OPERATIONS: &[&str] = &[
    "create_conversation",
    "store_message",
    "retrieve_messages",
    "list_conversations",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum MemoryOperation {
    CreateConversation {
        title: String,
    },
    StoreMessage {
        conversation_id: String,
        role: String,
        content: String,
    },
    RetrieveMessages {
        conversation_id: String,
        #[serde(default)]
        limit: usize,
    },
    ListConversations,
}

/// Agent wrapping the conversation/memory persistence collaborator.
///
/// The backend behind the store (in-memory, JSONL, SQLite) is invisible
/// here; every backend is driven through the same four operations.
pub struct MemoryAgent {
    store: Arc<dyn ConversationStore>,
    guard: CollaboratorGuard,
}

impl MemoryAgent {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self::with_policy(store, GuardPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn ConversationStore>, policy: GuardPolicy) -> Self {
        Self {
            store,
            guard: CollaboratorGuard::new(policy),
        }
    }

    pub fn capabilities() -> Vec<AgentCapability> {
        vec![
            AgentCapability::new(
                "create_conversation",
                "Create a new conversation and return its id",
                json!({
                    "type": "object",
                    "properties": { "title": { "type": "string" } },
                    "required": ["title"]
                }),
                json!({
                    "type": "object",
                    "properties": { "conversation_id": { "type": "string" } }
                }),
            ),
            AgentCapability::new(
                "store_message",
                "Append one message to a conversation",
                json!({
                    "type": "object",
                    "properties": {
                        "conversation_id": { "type": "string" },
                        "role": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["conversation_id", "role", "content"]
                }),
                json!({
                    "type": "object",
                    "properties": { "stored": { "type": "boolean" } }
                }),
            ),
            AgentCapability::new(
                "retrieve_messages",
                "Retrieve the most recent messages of a conversation in order",
                json!({
                    "type": "object",
                    "properties": {
                        "conversation_id": { "type": "string" },
                        "limit": { "type": "integer", "minimum": 0 }
                    },
                    "required": ["conversation_id"]
                }),
                json!({
                    "type": "object",
                    "properties": { "messages": { "type": "array" } }
                }),
            ),
            AgentCapability::new(
                "list_conversations",
                "List conversation summaries",
                json!({ "type": "object", "properties": {} }),
                json!({
                    "type": "object",
                    "properties": { "conversations": { "type": "array" } }
                }),
            ),
        ]
    }
}

#[async_trait]
impl Agent for MemoryAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Memory
    }

    async fn initialize(&self) -> Result<Vec<AgentCapability>, AgentError> {
        self.store
            .list_conversations()
            .await
            .map_err(|error| AgentError::Initialization(error.to_string()))?;
        Ok(Self::capabilities())
    }

    async fn execute_task(&self, task: &AgentTask) -> Result<Value, AgentError> {
        let operation: MemoryOperation =
            decode_operation(self.agent_type(), task, SUPPORTED_OPERATIONS)?;
        match operation {
            MemoryOperation::CreateConversation { title } => {
                let conversation_id = self
                    .guard
                    .run("memory.create_conversation", || {
                        self.store.create_conversation(&title)
                    })
                    .await?;
                Ok(json!({ "conversation_id": conversation_id, "title": title }))
            }
            MemoryOperation::StoreMessage {
                conversation_id,
                role,
                content,
            } => {
                let message = ConversationMessage {
                    role,
                    content,
                    timestamp_unix_ms: current_unix_timestamp_ms(),
                };
                self.guard
                    .run("memory.store_message", || {
                        self.store.store_message(&conversation_id, &message)
                    })
                    .await?;
                Ok(json!({ "conversation_id": conversation_id, "stored": true }))
            }
            MemoryOperation::RetrieveMessages {
                conversation_id,
                limit,
            } => {
                let messages = self
                    .guard
                    .run("memory.retrieve_messages", || {
                        self.store.retrieve_messages(&conversation_id, limit)
                    })
                    .await?;
                Ok(json!({ "conversation_id": conversation_id, "messages": messages }))
            }
            MemoryOperation::ListConversations => {
                let conversations = self
                    .guard
                    .run("memory.list_conversations", || {
                        self.store.list_conversations()
                    })
                    .await?;
                Ok(json!({ "conversations": conversations }))
            }
        }
    }

    async fn handle_message(&self, message: &AgentMessage) -> Result<(), AgentError> {
        debug!(message_id = %message.id, from = %message.from_agent, "memory agent received message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use quill_collaborator::InMemoryConversationStore;
    use quill_task::{AgentTask, AgentType};

    use crate::contract::{Agent, AgentError};

    use super::MemoryAgent;

    fn task_for(input: Value) -> AgentTask {
        let Value::Object(map) = input else {
            panic!("task input must be an object");
        };
        AgentTask::new(AgentType::Memory, "memory op").with_input(map)
    }

    #[tokio::test]
    async fn functional_conversation_lifecycle_through_the_agent() {
        let agent = MemoryAgent::new(Arc::new(InMemoryConversationStore::new()));

        let created = agent
            .execute_task(&task_for(
                json!({ "operation": "create_conversation", "title": "planning" }),
            ))
            .await
            .expect("create");
        let conversation_id = created["conversation_id"]
            .as_str()
            .expect("conversation id")
            .to_string();

        agent
            .execute_task(&task_for(json!({
                "operation": "store_message",
                "conversation_id": conversation_id,
                "role": "user",
                "content": "remember the deadline"
            })))
            .await
            .expect("store");

        let retrieved = agent
            .execute_task(&task_for(json!({
                "operation": "retrieve_messages",
                "conversation_id": conversation_id
            })))
            .await
            .expect("retrieve");
        assert_eq!(retrieved["messages"][0]["content"], "remember the deadline");

        let listed = agent
            .execute_task(&task_for(json!({ "operation": "list_conversations" })))
            .await
            .expect("list");
        assert_eq!(listed["conversations"][0]["title"], "planning");
        assert_eq!(listed["conversations"][0]["message_count"], 1);
    }

    #[tokio::test]
    async fn functional_store_into_unknown_conversation_fails() {
        let agent = MemoryAgent::new(Arc::new(InMemoryConversationStore::new()));
        let error = agent
            .execute_task(&task_for(json!({
                "operation": "store_message",
                "conversation_id": "quill-conv-0-missing",
                "role": "user",
                "content": "lost"
            })))
            .await
            .expect_err("unknown conversation");
        assert!(matches!(error, AgentError::Collaborator(_)));
    }
}
