//! Planner agent: decomposes a goal description into a validated task graph.
//!
//! The planner's sole collaborator is a text-generation provider. Its prompt
//! carries the capability union of every registered agent; its response must
//! parse as a JSON array of task steps with known agent types and
//! backward-only dependency references. Anything else fails the whole goal
//! with [`PlanParseError`], never a partial plan.

mod parse;
mod prompt;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use quill_agent::{Agent, AgentCapability, AgentError};
use quill_collaborator::{CollaboratorGuard, GenerationRequest, GuardPolicy, TextGenerator};
use quill_task::{AgentMessage, AgentTask, AgentType, TaskGraph};

pub use parse::parse_plan;
pub use prompt::build_planner_prompt;

/// Default deadline on one plan-generation round trip.
pub const DEFAULT_GENERATION_TIMEOUT_MS: u64 = 60_000;

/// The capability union the planner advertises to the generation provider.
pub type CapabilityUnion = BTreeMap<AgentType, Vec<AgentCapability>>;

#[derive(Debug, Error)]
/// Enumerates supported `PlanParseError` values.
pub enum PlanParseError {
    #[error("plan generation failed: {0}")]
    Generation(String),
    #[error("plan generation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("planner output is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("planner output must be a JSON array of task steps")]
    NotAnArray,
    #[error("planner produced an empty plan")]
    EmptyPlan,
    #[error("plan step {index} names unknown agent type '{raw}'")]
    UnknownAgentType { index: usize, raw: String },
    #[error("plan step {index} targets agent type '{agent_type}' with no registered agent")]
    UnregisteredAgentType {
        index: usize,
        agent_type: AgentType,
    },
    #[error("plan step {index} references dependency {reference}, which is not an earlier step")]
    ForwardDependency { index: usize, reference: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Public struct `PlannerConfig` used across Quill components.
pub struct PlannerConfig {
    pub generation_timeout_ms: u64,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            generation_timeout_ms: DEFAULT_GENERATION_TIMEOUT_MS,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// The planner agent.
///
/// Holds a snapshot of the registered capability union; the orchestrator
/// refreshes the snapshot whenever agent registration changes.
pub struct Planner {
    generator: Arc<dyn TextGenerator>,
    guard: CollaboratorGuard,
    config: PlannerConfig,
    capability_union: Mutex<CapabilityUnion>,
}

impl Planner {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self::with_config(generator, PlannerConfig::default(), GuardPolicy::default())
    }

    pub fn with_config(
        generator: Arc<dyn TextGenerator>,
        config: PlannerConfig,
        policy: GuardPolicy,
    ) -> Self {
        Self {
            generator,
            guard: CollaboratorGuard::new(policy),
            config,
            capability_union: Mutex::new(CapabilityUnion::new()),
        }
    }

    /// Replaces the capability snapshot used in subsequent prompts.
    pub fn set_capability_union(&self, union: CapabilityUnion) {
        let mut snapshot = lock_or_recover(&self.capability_union);
        *snapshot = union;
    }

    fn capability_snapshot(&self) -> CapabilityUnion {
        lock_or_recover(&self.capability_union).clone()
    }

    /// Decomposes `goal` into a validated task graph.
    ///
    /// Step dependencies come back as indices into the plan array and are
    /// rewritten to the generated task ids; only backward references are
    /// accepted.
    pub async fn plan(
        &self,
        goal: &str,
        union: &CapabilityUnion,
    ) -> Result<TaskGraph, PlanParseError> {
        let messages = build_planner_prompt(goal, union);
        let mut request = GenerationRequest::from_messages(messages);
        request.max_tokens = self.config.max_tokens;
        request.temperature = self.config.temperature;

        let deadline = Duration::from_millis(self.config.generation_timeout_ms.max(1));
        let generation = tokio::time::timeout(
            deadline,
            self.guard
                .run("planner.generate", || self.generator.generate(request.clone())),
        )
        .await
        .map_err(|_| PlanParseError::Timeout {
            timeout_ms: self.config.generation_timeout_ms,
        })?
        .map_err(|error| PlanParseError::Generation(error.to_string()))?;

        let registered: Vec<AgentType> = union.keys().copied().collect();
        let graph = parse_plan(&generation.text, &registered)?;
        debug!(
            goal,
            task_count = graph.len(),
            "planner produced a task graph"
        );
        Ok(graph)
    }
}

#[async_trait]
impl Agent for Planner {
    fn agent_type(&self) -> AgentType {
        AgentType::Planner
    }

    async fn initialize(&self) -> Result<Vec<AgentCapability>, AgentError> {
        Ok(vec![AgentCapability::new(
            "plan",
            "Decompose a goal into a dependency-ordered task graph",
            json!({
                "type": "object",
                "properties": { "goal": { "type": "string" } },
                "required": ["goal"]
            }),
            json!({
                "type": "object",
                "properties": { "tasks": { "type": "array" } }
            }),
        )])
    }

    async fn execute_task(&self, task: &AgentTask) -> Result<Value, AgentError> {
        let goal = task
            .input_data
            .get("goal")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AgentError::InvalidInput(format!(
                    "task '{}' is missing the string 'goal' field",
                    task.id
                ))
            })?;
        let union = self.capability_snapshot();
        let graph = self
            .plan(goal, &union)
            .await
            .map_err(|error| AgentError::InvalidInput(error.to_string()))?;
        Ok(json!({ "tasks": graph.tasks() }))
    }

    async fn handle_message(&self, message: &AgentMessage) -> Result<(), AgentError> {
        debug!(message_id = %message.id, from = %message.from_agent, "planner received message");
        Ok(())
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
