use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use quill_collaborator::{CollaboratorGuard, GuardPolicy, RetrievalEngine};
use quill_task::{AgentMessage, AgentTask, AgentType};

use crate::contract::{decode_operation, Agent, AgentCapability, AgentError};

const SUPPORTED_OPERATIONS: &[&str] = &["search", "generate"];

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum RetrievalOperation {
    Search {
        query: String,
        #[serde(default = "default_search_limit")]
        limit: usize,
    },
    Generate {
        query: String,
        #[serde(default)]
        use_context: bool,
    },
}

fn default_search_limit() -> usize {
    10
}

/// Agent wrapping the retrieval/RAG engine collaborator.
pub struct RetrievalAgent {
    engine: Arc<dyn RetrievalEngine>,
    guard: CollaboratorGuard,
}

impl RetrievalAgent {
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
                "search",
                "Semantic search over the indexed corpus",
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
                    "properties": { "documents": { "type": "array" } }
                }),
            ),
            AgentCapability::new(
                "generate",
                "Generate text for a query, optionally grounded in retrieved context",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "use_context": { "type": "boolean" }
                    },
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
impl Agent for RetrievalAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Retrieval
    }

    async fn initialize(&self) -> Result<Vec<AgentCapability>, AgentError> {
        self.engine
            .search("", 1)
            .await
            .map_err(|error| AgentError::Initialization(error.to_string()))?;
        Ok(Self::capabilities())
    }

    async fn execute_task(&self, task: &AgentTask) -> Result<Value, AgentError> {
        let operation: RetrievalOperation =
            decode_operation(self.agent_type(), task, SUPPORTED_OPERATIONS)?;
        match operation {
            RetrievalOperation::Search { query, limit } => {
                let documents = self
                    .guard
                    .run("retrieval.search", || self.engine.search(&query, limit))
                    .await?;
                Ok(json!({ "query": query, "documents": documents }))
            }
            RetrievalOperation::Generate { query, use_context } => {
                let text = self
                    .guard
                    .run("retrieval.generate", || {
                        self.engine.generate(&query, use_context)
                    })
                    .await?;
                Ok(json!({ "query": query, "text": text }))
            }
        }
    }

    async fn handle_message(&self, message: &AgentMessage) -> Result<(), AgentError> {
        debug!(message_id = %message.id, from = %message.from_agent, "retrieval agent received message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use quill_collaborator::{CollaboratorError, RankedDocument, RetrievalEngine};
    use quill_task::{AgentTask, AgentType};

    use crate::contract::{Agent, AgentError};

    use super::RetrievalAgent;

    #[derive(Default)]
    struct ScriptedEngine {
        search_results: Mutex<VecDeque<Result<Vec<RankedDocument>, CollaboratorError>>>,
        generate_results: Mutex<VecDeque<Result<String, CollaboratorError>>>,
    }

    #[async_trait]
    impl RetrievalEngine for ScriptedEngine {
        async fn search(
            &self,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<RankedDocument>, CollaboratorError> {
            self.search_results
                .lock()
                .expect("search lock")
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn generate(
            &self,
            _query: &str,
            _use_context: bool,
        ) -> Result<String, CollaboratorError> {
            self.generate_results
                .lock()
                .expect("generate lock")
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn task_for(input: Value) -> AgentTask {
        let Value::Object(map) = input else {
            panic!("task input must be an object");
        };
        AgentTask::new(AgentType::Retrieval, "retrieval op").with_input(map)
    }

    #[tokio::test]
    async fn functional_search_returns_ranked_documents() {
        let engine = ScriptedEngine::default();
        engine
            .search_results
            .lock()
            .expect("seed")
            .push_back(Ok(vec![RankedDocument {
                id: "doc-1".to_string(),
                content: "rust ownership notes".to_string(),
                score: 0.92,
            }]));
        let agent = RetrievalAgent::new(Arc::new(engine));

        let result = agent
            .execute_task(&task_for(
                json!({ "operation": "search", "query": "ownership", "limit": 3 }),
            ))
            .await
            .expect("search");
        assert_eq!(result["query"], "ownership");
        assert_eq!(result["documents"][0]["id"], "doc-1");
    }

    #[tokio::test]
    async fn functional_generate_defaults_to_no_context() {
        let engine = ScriptedEngine::default();
        engine
            .generate_results
            .lock()
            .expect("seed")
            .push_back(Ok("a short answer".to_string()));
        let agent = RetrievalAgent::new(Arc::new(engine));

        let result = agent
            .execute_task(&task_for(
                json!({ "operation": "generate", "query": "what is borrowing" }),
            ))
            .await
            .expect("generate");
        assert_eq!(result["text"], "a short answer");
    }

    #[tokio::test]
    async fn functional_collaborator_fault_surfaces_as_agent_error() {
        let engine = ScriptedEngine::default();
        engine
            .search_results
            .lock()
            .expect("seed")
            .push_back(Err(CollaboratorError::InvalidRequest(
                "empty query".to_string(),
            )));
        let agent = RetrievalAgent::new(Arc::new(engine));

        let error = agent
            .execute_task(&task_for(json!({ "operation": "search", "query": "" })))
            .await
            .expect_err("fault");
        assert!(matches!(error, AgentError::Collaborator(_)));
    }
}
