use serde::Deserialize;
use serde_json::Value;

use quill_task::{AgentTask, AgentType, TaskGraph};

use crate::PlanParseError;

#[derive(Debug, Deserialize)]
struct RawPlanStep {
    agent_type: String,
    description: String,
    #[serde(default)]
    input_data: serde_json::Map<String, Value>,
    #[serde(default)]
    dependencies: Vec<usize>,
}

/// Parses generation output into a task graph.
///
/// Accepts the raw array, or the array wrapped in ```json fences, since
/// providers frequently fence their output despite instructions. Every step
/// must name a registered agent type and reference only earlier steps.
pub fn parse_plan(raw: &str, registered: &[AgentType]) -> Result<TaskGraph, PlanParseError> {
    let payload = extract_json_payload(raw);
    let value: Value = serde_json::from_str(payload)
        .map_err(|error| PlanParseError::InvalidJson(error.to_string()))?;
    if !value.is_array() {
        return Err(PlanParseError::NotAnArray);
    }
    let steps: Vec<RawPlanStep> = serde_json::from_value(value)
        .map_err(|error| PlanParseError::InvalidJson(error.to_string()))?;
    if steps.is_empty() {
        return Err(PlanParseError::EmptyPlan);
    }

    let mut tasks: Vec<AgentTask> = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        let agent_type = AgentType::parse(&step.agent_type).ok_or_else(|| {
            PlanParseError::UnknownAgentType {
                index,
                raw: step.agent_type.clone(),
            }
        })?;
        if !registered.contains(&agent_type) {
            return Err(PlanParseError::UnregisteredAgentType { index, agent_type });
        }

        let mut dependency_ids = Vec::with_capacity(step.dependencies.len());
        for reference in step.dependencies {
            if reference >= index {
                return Err(PlanParseError::ForwardDependency { index, reference });
            }
            dependency_ids.push(tasks[reference].id.clone());
        }

        let task = AgentTask::new(agent_type, step.description)
            .with_input(step.input_data)
            .with_dependencies(dependency_ids);
        tasks.push(task);
    }

    Ok(TaskGraph::new(tasks))
}

/// Strips an optional markdown fence and leading prose around the array.
fn extract_json_payload(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(fenced) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    {
        if let Some(body) = fenced.rsplit_once("```") {
            return body.0.trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use quill_task::AgentType;

    use super::{parse_plan, PlanParseError};

    const ALL_TYPES: &[AgentType] = &[
        AgentType::VaultManager,
        AgentType::Retrieval,
        AgentType::Context,
        AgentType::Memory,
    ];

    #[test]
    fn functional_fenced_output_is_accepted() {
        let raw = "```json\n[{ \"agent_type\": \"retrieval\", \"description\": \"search\" }]\n```";
        let graph = parse_plan(raw, ALL_TYPES).expect("fenced plan");
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn unit_hyphenated_agent_type_spelling_is_accepted() {
        let raw = r#"[{ "agent_type": "vault-manager", "description": "write" }]"#;
        let graph = parse_plan(raw, ALL_TYPES).expect("hyphenated spelling");
        assert_eq!(graph.tasks()[0].agent_type, AgentType::VaultManager);
    }

    #[test]
    fn unit_json_object_output_is_rejected_as_not_an_array() {
        let raw = r#"{ "agent_type": "retrieval", "description": "search" }"#;
        let error = parse_plan(raw, ALL_TYPES).expect_err("object output");
        assert!(matches!(error, PlanParseError::NotAnArray));
    }

    #[test]
    fn unit_empty_array_is_rejected() {
        let error = parse_plan("[]", ALL_TYPES).expect_err("empty plan");
        assert!(matches!(error, PlanParseError::EmptyPlan));
    }

    #[test]
    fn regression_self_reference_counts_as_forward_dependency() {
        let raw = r#"[{ "agent_type": "retrieval", "description": "loop", "dependencies": [0] }]"#;
        let error = parse_plan(raw, ALL_TYPES).expect_err("self reference");
        assert!(matches!(
            error,
            PlanParseError::ForwardDependency {
                index: 0,
                reference: 0
            }
        ));
    }

    #[test]
    fn functional_dependency_indices_map_to_generated_task_ids() {
        let raw = r#"[
            { "agent_type": "retrieval", "description": "search" },
            { "agent_type": "context", "description": "assemble", "dependencies": [0] },
            { "agent_type": "vault_manager", "description": "write", "dependencies": [0, 1] }
        ]"#;
        let graph = parse_plan(raw, ALL_TYPES).expect("chain plan");
        let tasks = graph.tasks();
        assert!(tasks[1].dependencies.contains(&tasks[0].id));
        assert!(tasks[2].dependencies.contains(&tasks[0].id));
        assert!(tasks[2].dependencies.contains(&tasks[1].id));
        graph.validate().expect("constructed graph validates");
    }
}
