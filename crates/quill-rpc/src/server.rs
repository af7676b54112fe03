//! JSON-RPC request dispatch over a running orchestrator.

use std::future::Future;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Map, Value};
use tracing::warn;

use quill_orchestrator::{read_dispatch_events, Orchestrator, TaskReport};
use quill_task::{AgentTask, AgentType, TaskStatus};

use crate::framing::{
    error_frame, read_content_length_frame, result_frame, write_content_length_frame,
    JSONRPC_VERSION,
};

pub const RPC_PROTOCOL_VERSION: &str = "2024-11-05";
pub const RPC_SERVER_NAME: &str = "quill-orchestrator";

pub const RPC_ERROR_PARSE: i64 = -32700;
pub const RPC_ERROR_INVALID_REQUEST: i64 = -32600;
pub const RPC_ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const RPC_ERROR_INVALID_PARAMS: i64 = -32602;

const RESOURCE_URI_STATUS: &str = "quill://orchestrator/status";
const RESOURCE_URI_DISPATCH_LOG: &str = "quill://orchestrator/dispatch-log";

/// Public struct `RpcServerState` used across quill rpc serving components.
pub struct RpcServerState {
    orchestrator: Orchestrator,
    events_log_path: Option<PathBuf>,
}

impl RpcServerState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            events_log_path: None,
        }
    }

    /// Exposes the dispatch event log as a readable resource.
    pub fn with_events_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.events_log_path = Some(path.into());
        self
    }
}

/// Public struct `RpcDispatchError` used across quill rpc serving components.
#[derive(Debug)]
pub struct RpcDispatchError {
    pub id: Value,
    pub code: i64,
    pub message: String,
}

impl RpcDispatchError {
    fn new(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            code,
            message: message.into(),
        }
    }
}

/// Public struct `RpcServeReport` used across quill rpc serving components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcServeReport {
    pub processed_frames: usize,
    pub error_count: usize,
}

struct JsonRpcRequest {
    id: Value,
    method: String,
    params: Map<String, Value>,
}

struct RpcToolDescriptor {
    name: String,
    description: String,
    input_schema: Value,
}

/// Serves framed JSON-RPC requests until end of stream, answering each frame
/// with exactly one result or error frame.
pub fn serve_jsonrpc_reader<R, W>(
    reader: &mut R,
    writer: &mut W,
    state: &RpcServerState,
) -> Result<RpcServeReport>
where
    R: BufRead,
    W: Write,
{
    let mut processed_frames = 0usize;
    let mut error_count = 0usize;

    loop {
        let frame = match read_content_length_frame(reader) {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(error) => {
                let response = error_frame(
                    Value::Null,
                    RPC_ERROR_PARSE,
                    format!("failed to read rpc frame: {error}"),
                );
                write_content_length_frame(writer, &response)?;
                error_count = error_count.saturating_add(1);
                break;
            }
        };
        processed_frames = processed_frames.saturating_add(1);

        let response = match parse_jsonrpc_request(&frame) {
            Ok(request) => match dispatch_jsonrpc_request(&request, state) {
                Ok(result) => result_frame(request.id, result),
                Err(error) => {
                    error_count = error_count.saturating_add(1);
                    error_frame(error.id, error.code, error.message)
                }
            },
            Err(error) => {
                error_count = error_count.saturating_add(1);
                error_frame(error.id, error.code, error.message)
            }
        };
        write_content_length_frame(writer, &response)?;
    }

    if error_count > 0 {
        warn!(
            processed_frames = processed_frames,
            error_count = error_count,
            "rpc serve loop finished with errors"
        );
    }
    Ok(RpcServeReport {
        processed_frames,
        error_count,
    })
}

fn parse_jsonrpc_request(value: &Value) -> Result<JsonRpcRequest, RpcDispatchError> {
    let Some(object) = value.as_object() else {
        return Err(RpcDispatchError::new(
            Value::Null,
            RPC_ERROR_INVALID_REQUEST,
            "jsonrpc request must be an object",
        ));
    };
    let id = object.get("id").cloned().ok_or_else(|| {
        RpcDispatchError::new(
            Value::Null,
            RPC_ERROR_INVALID_REQUEST,
            "jsonrpc request must include id",
        )
    })?;
    let jsonrpc = object
        .get("jsonrpc")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if jsonrpc != JSONRPC_VERSION {
        return Err(RpcDispatchError::new(
            id,
            RPC_ERROR_INVALID_REQUEST,
            format!("jsonrpc must be '{JSONRPC_VERSION}'"),
        ));
    }
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            RpcDispatchError::new(
                id.clone(),
                RPC_ERROR_INVALID_REQUEST,
                "jsonrpc request must include non-empty method",
            )
        })?;
    let params = match object.get("params") {
        Some(Value::Object(params)) => params.clone(),
        Some(_) => {
            return Err(RpcDispatchError::new(
                id,
                RPC_ERROR_INVALID_PARAMS,
                "jsonrpc request params must be an object",
            ))
        }
        None => Map::new(),
    };
    Ok(JsonRpcRequest {
        id,
        method: method.to_string(),
        params,
    })
}

fn dispatch_jsonrpc_request(
    request: &JsonRpcRequest,
    state: &RpcServerState,
) -> Result<Value, RpcDispatchError> {
    match request.method.as_str() {
        "initialize" => Ok(handle_initialize()),
        "tools/list" => Ok(handle_tools_list(state)),
        "tools/call" => handle_tools_call(state, &request.params).map_err(|error| {
            RpcDispatchError::new(request.id.clone(), RPC_ERROR_INVALID_PARAMS, error.to_string())
        }),
        "resources/list" => Ok(handle_resources_list(state)),
        "resources/read" => handle_resources_read(state, &request.params).map_err(|error| {
            RpcDispatchError::new(request.id.clone(), RPC_ERROR_INVALID_PARAMS, error.to_string())
        }),
        other => Err(RpcDispatchError::new(
            request.id.clone(),
            RPC_ERROR_METHOD_NOT_FOUND,
            format!("unsupported method '{other}'"),
        )),
    }
}

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": RPC_PROTOCOL_VERSION,
        "serverInfo": {
            "name": RPC_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "capabilities": {
            "tools": {
                "listChanged": false
            },
            "resources": {
                "listChanged": false
            }
        }
    })
}

fn handle_tools_list(state: &RpcServerState) -> Value {
    let mut tools = Vec::new();
    for (agent_type, capabilities) in state.orchestrator.capabilities() {
        for capability in capabilities {
            tools.push(RpcToolDescriptor {
                name: format!("{}.{}", agent_type.as_str(), capability.name),
                description: capability.description.clone(),
                input_schema: capability.input_schema.clone(),
            });
        }
    }
    tools.sort_by(|left, right| left.name.cmp(&right.name));
    json!({
        "tools": tools
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema
                })
            })
            .collect::<Vec<_>>()
    })
}

fn handle_tools_call(state: &RpcServerState, params: &Map<String, Value>) -> Result<Value> {
    let tool_name = params
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("tools/call requires non-empty field 'name'"))?;
    let arguments = match params.get("arguments") {
        Some(Value::Object(arguments)) => arguments.clone(),
        Some(_) => bail!("tools/call field 'arguments' must be an object when provided"),
        None => Map::new(),
    };

    let (agent_raw, operation) = tool_name
        .split_once('.')
        .ok_or_else(|| anyhow!("tool name '{tool_name}' must be '<agent_type>.<operation>'"))?;
    let agent_type = AgentType::parse(agent_raw)
        .ok_or_else(|| anyhow!("unknown agent type '{agent_raw}' in tool name"))?;
    let registered = state
        .orchestrator
        .capabilities()
        .get(&agent_type)
        .map(|capabilities| {
            capabilities
                .iter()
                .any(|capability| capability.name == operation)
        })
        .unwrap_or(false);
    if !registered {
        bail!("unknown tool '{tool_name}'");
    }

    let mut input_data = arguments;
    input_data
        .entry("operation".to_string())
        .or_insert_with(|| Value::String(operation.to_string()));
    let task = AgentTask::new(agent_type, format!("rpc tool call '{tool_name}'"))
        .with_input(input_data);
    let report = block_on_orchestrator(state.orchestrator.run_task(task))??;
    Ok(tool_call_result(&report))
}

fn tool_call_result(report: &TaskReport) -> Value {
    let structured = serde_json::to_value(report)
        .unwrap_or_else(|_| json!({"error": "failed to serialize task report"}));
    let text = serde_json::to_string_pretty(&structured)
        .unwrap_or_else(|_| "{\"error\":\"failed to serialize task report\"}".to_string());
    json!({
        "content": [{
            "type": "text",
            "text": text
        }],
        "isError": report.status != TaskStatus::Completed,
        "structuredContent": structured,
    })
}

fn handle_resources_list(state: &RpcServerState) -> Value {
    let mut resources = vec![json!({
        "uri": RESOURCE_URI_STATUS,
        "name": "orchestrator-status",
        "description": "Live agent availability and queue depth snapshot",
        "mimeType": "application/json"
    })];
    if state.events_log_path.is_some() {
        resources.push(json!({
            "uri": RESOURCE_URI_DISPATCH_LOG,
            "name": "dispatch-event-log",
            "description": "Append-only task dispatch lifecycle event log",
            "mimeType": "application/x-ndjson"
        }));
    }
    json!({ "resources": resources })
}

fn handle_resources_read(state: &RpcServerState, params: &Map<String, Value>) -> Result<Value> {
    let uri = params
        .get("uri")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("resources/read requires non-empty field 'uri'"))?;
    match uri {
        RESOURCE_URI_STATUS => {
            let status = block_on_orchestrator(state.orchestrator.get_status())??;
            let text = serde_json::to_string_pretty(&status)
                .context("failed to serialize orchestrator status")?;
            Ok(json!({
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/json",
                    "text": text
                }]
            }))
        }
        RESOURCE_URI_DISPATCH_LOG => {
            let path = state
                .events_log_path
                .as_ref()
                .ok_or_else(|| anyhow!("dispatch event log is not configured"))?;
            let mut text = String::new();
            if path.exists() {
                for event in read_dispatch_events(path)? {
                    text.push_str(
                        &serde_json::to_string(&event)
                            .context("failed to serialize dispatch event")?,
                    );
                    text.push('\n');
                }
            }
            Ok(json!({
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/x-ndjson",
                    "text": text
                }]
            }))
        }
        other => bail!("unknown resource uri '{other}'"),
    }
}

fn block_on_orchestrator<F>(future: F) -> Result<F::Output>
where
    F: Future,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(future))),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to create tokio runtime for rpc dispatch")?;
            Ok(runtime.block_on(future))
        }
    }
}
