use std::{
    collections::{BTreeMap, VecDeque},
    io::Cursor,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{json, Value};

use quill_agent::{MemoryAgent, RetrievalAgent, VaultManagerAgent};
use quill_collaborator::{
    CollaboratorError, ConversationStore, GenerationRequest, GenerationResponse,
    InMemoryConversationStore, JsonlConversationStore, NoteMatch, RankedDocument,
    RetrievalEngine, TextGenerator, VaultStore, WriteMode,
};
use quill_orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig, OrchestratorError};
use quill_planner::Planner;
use quill_rpc::{
    read_content_length_frame, request_frame, serve_jsonrpc_reader, write_content_length_frame,
    RpcServerState,
};
use quill_task::{AgentTask, AgentType, TaskGraph, TaskStatus};

struct ScriptedGenerator {
    responses: Mutex<VecDeque<GenerationResponse>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    fn new(texts: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(
                texts
                    .into_iter()
                    .map(|text| GenerationResponse {
                        text: text.to_string(),
                        finish_reason: Some("stop".to_string()),
                    })
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, CollaboratorError> {
        self.requests.lock().expect("requests lock").push(request);
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .ok_or_else(|| {
                CollaboratorError::InvalidResponse("scripted response queue exhausted".to_string())
            })
    }
}

struct StaticRetrieval;

#[async_trait]
impl RetrievalEngine for StaticRetrieval {
    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RankedDocument>, CollaboratorError> {
        Ok(vec![RankedDocument {
            id: "doc-1".to_string(),
            content: format!("notes matching '{query}'"),
            score: 0.9,
        }]
        .into_iter()
        .take(limit.max(1))
        .collect())
    }

    async fn generate(&self, query: &str, _use_context: bool) -> Result<String, CollaboratorError> {
        Ok(format!("answer for '{query}'"))
    }
}

/// Vault whose writes fail for one configured path.
struct FlakyVault {
    notes: Mutex<BTreeMap<String, String>>,
    locked_path: String,
    probe_unavailable: bool,
}

impl FlakyVault {
    fn new(locked_path: &str) -> Self {
        Self {
            notes: Mutex::new(BTreeMap::new()),
            locked_path: locked_path.to_string(),
            probe_unavailable: false,
        }
    }

    fn unavailable() -> Self {
        Self {
            notes: Mutex::new(BTreeMap::new()),
            locked_path: String::new(),
            probe_unavailable: true,
        }
    }
}

#[async_trait]
impl VaultStore for FlakyVault {
    async fn read_note(&self, path: &str) -> Result<String, CollaboratorError> {
        self.notes
            .lock()
            .expect("notes lock")
            .get(path)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("note '{path}'")))
    }

    async fn write_note(
        &self,
        path: &str,
        content: &str,
        _mode: WriteMode,
    ) -> Result<(), CollaboratorError> {
        if path == self.locked_path {
            return Err(CollaboratorError::Backend(format!(
                "vault file '{path}' is locked"
            )));
        }
        self.notes
            .lock()
            .expect("notes lock")
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn delete_note(&self, path: &str) -> Result<(), CollaboratorError> {
        self.notes.lock().expect("notes lock").remove(path);
        Ok(())
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<NoteMatch>, CollaboratorError> {
        if self.probe_unavailable {
            return Err(CollaboratorError::Unavailable(
                "vault index offline".to_string(),
            ));
        }
        Ok(Vec::new())
    }

    async fn update_frontmatter(
        &self,
        _path: &str,
        _key: &str,
        _value: Value,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn update_tags(
        &self,
        _path: &str,
        _add: &[String],
        _remove: &[String],
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

fn input_map(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object input, got {other}"),
    }
}

#[tokio::test]
async fn integration_planner_goal_runs_to_completion_across_agents() {
    let plan = r#"```json
[
  {
    "agent_type": "retrieval",
    "description": "find the relevant notes",
    "input_data": { "operation": "search", "query": "quarterly report", "limit": 3 }
  },
  {
    "agent_type": "memory",
    "description": "open a conversation for the digest",
    "input_data": { "operation": "create_conversation", "title": "quarterly digest" },
    "dependencies": [0]
  }
]
```"#;
    let generator = Arc::new(ScriptedGenerator::new(vec![plan]));
    let conversations = Arc::new(InMemoryConversationStore::new());

    let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
        .register_agent(Arc::new(RetrievalAgent::new(Arc::new(StaticRetrieval))))
        .register_agent(Arc::new(MemoryAgent::new(conversations.clone())))
        .with_planner(Arc::new(Planner::new(generator.clone())))
        .start()
        .await;

    let report = orchestrator
        .execute_goal("compile the quarterly report digest")
        .await
        .expect("goal executes");
    assert_eq!(report.reports.len(), 2);
    for (task_id, task_report) in &report.reports {
        assert_eq!(
            task_report.status,
            TaskStatus::Completed,
            "task {task_id} should complete: {:?}",
            task_report.error
        );
    }

    let summaries = conversations
        .list_conversations()
        .await
        .expect("list conversations");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].title, "quarterly digest");

    // The planner prompt advertises registered operations so the model can
    // only plan against real capabilities.
    let requests = generator.requests.lock().expect("requests lock");
    assert_eq!(requests.len(), 1);
    assert!(requests[0]
        .messages
        .iter()
        .any(|message| message.content.contains("search")));
    drop(requests);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn integration_failed_dependency_cancels_downstream_tasks() {
    let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
        .register_agent(Arc::new(VaultManagerAgent::new(Arc::new(FlakyVault::new(
            "reports/locked.md",
        )))))
        .register_agent(Arc::new(RetrievalAgent::new(Arc::new(StaticRetrieval))))
        .start()
        .await;

    let write = AgentTask::new(AgentType::VaultManager, "write the digest note").with_input(
        input_map(json!({
            "operation": "write_note",
            "path": "reports/locked.md",
            "content": "digest",
            "mode": "overwrite"
        })),
    );
    let write_id = write.id.clone();
    let reread = AgentTask::new(AgentType::VaultManager, "verify the digest note")
        .with_input(input_map(
            json!({ "operation": "read_note", "path": "reports/locked.md" }),
        ))
        .with_dependencies([write_id.clone()]);
    let reread_id = reread.id.clone();
    let index = AgentTask::new(AgentType::Retrieval, "index the digest")
        .with_input(input_map(json!({ "operation": "search", "query": "digest" })))
        .with_dependencies([reread_id.clone()]);
    let index_id = index.id.clone();

    let report = orchestrator
        .execute_graph("goal-digest", TaskGraph::new(vec![write, reread, index]))
        .await
        .expect("graph executes");

    let write_report = &report.reports[&write_id];
    assert_eq!(write_report.status, TaskStatus::Failed);
    assert!(write_report
        .error
        .as_deref()
        .expect("write error")
        .contains("locked"));

    let reread_report = &report.reports[&reread_id];
    assert_eq!(reread_report.status, TaskStatus::Cancelled);
    assert!(reread_report
        .error
        .as_deref()
        .expect("reread reason")
        .contains(&write_id));

    assert_eq!(report.reports[&index_id].status, TaskStatus::Cancelled);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn integration_unavailable_agent_is_isolated_from_the_rest() {
    let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
        .register_agent(Arc::new(VaultManagerAgent::new(Arc::new(
            FlakyVault::unavailable(),
        ))))
        .register_agent(Arc::new(RetrievalAgent::new(Arc::new(StaticRetrieval))))
        .start()
        .await;

    assert!(!orchestrator
        .capabilities()
        .contains_key(&AgentType::VaultManager));

    let report = orchestrator
        .run_task(
            AgentTask::new(AgentType::Retrieval, "search despite vault outage").with_input(
                input_map(json!({ "operation": "search", "query": "release notes" })),
            ),
        )
        .await
        .expect("retrieval still runs");
    assert_eq!(report.status, TaskStatus::Completed);

    let error = orchestrator
        .submit_task(
            AgentTask::new(AgentType::VaultManager, "read a note").with_input(input_map(
                json!({ "operation": "read_note", "path": "a.md" }),
            )),
        )
        .await
        .expect_err("vault agent is unavailable");
    assert!(matches!(
        error,
        OrchestratorError::UnknownAgentType(AgentType::VaultManager)
    ));

    orchestrator.shutdown().await;
}

fn serve_one(orchestrator: &Orchestrator, frame: Value) -> Value {
    let state = RpcServerState::new(orchestrator.clone());
    let mut input = Vec::new();
    write_content_length_frame(&mut input, &frame).expect("encode request");
    let mut reader = Cursor::new(input);
    let mut output = Vec::new();
    serve_jsonrpc_reader(&mut reader, &mut output, &state).expect("serve");
    read_content_length_frame(&mut Cursor::new(output))
        .expect("decode response")
        .expect("response present")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn integration_rpc_tools_call_round_trip_through_memory_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store =
        JsonlConversationStore::open(temp.path().join("conversations")).expect("open store");

    let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
        .register_agent(Arc::new(MemoryAgent::new(Arc::new(store))))
        .start()
        .await;

    let created = serve_one(
        &orchestrator,
        request_frame(
            json!(1),
            "tools/call",
            json!({
                "name": "memory.create_conversation",
                "arguments": { "title": "standup notes" }
            }),
        ),
    );
    assert_eq!(created["result"]["isError"], json!(false));
    let conversation_id = created["result"]["structuredContent"]["result"]["conversation_id"]
        .as_str()
        .expect("conversation id")
        .to_string();

    let stored = serve_one(
        &orchestrator,
        request_frame(
            json!(2),
            "tools/call",
            json!({
                "name": "memory.store_message",
                "arguments": {
                    "conversation_id": conversation_id.clone(),
                    "role": "user",
                    "content": "deploy window moved to friday"
                }
            }),
        ),
    );
    assert_eq!(stored["result"]["isError"], json!(false));

    let retrieved = serve_one(
        &orchestrator,
        request_frame(
            json!(3),
            "tools/call",
            json!({
                "name": "memory.retrieve_messages",
                "arguments": { "conversation_id": conversation_id }
            }),
        ),
    );
    let messages = retrieved["result"]["structuredContent"]["result"]["messages"]
        .as_array()
        .expect("messages array");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], json!("deploy window moved to friday"));

    orchestrator.shutdown().await;
}
