use quill_collaborator::PromptMessage;

use crate::CapabilityUnion;

/// Builds the planning prompt: a system message carrying the output contract
/// and the capability union, plus the goal as the user message.
pub fn build_planner_prompt(goal: &str, union: &CapabilityUnion) -> Vec<PromptMessage> {
    let mut capability_lines = String::new();
    for (agent_type, capabilities) in union {
        capability_lines.push_str(&format!("- {agent_type}:\n"));
        for capability in capabilities {
            capability_lines.push_str(&format!(
                "  - {}: {}\n",
                capability.name, capability.description
            ));
        }
    }

    let system = format!(
        "You are a task planner for a note-vault assistant. Decompose the \
user's goal into a JSON array of task steps and output only that array, \
no prose and no code fences.\n\
Each step is an object with fields:\n\
  \"agent_type\": one of the agent types listed below\n\
  \"description\": short imperative description of the step\n\
  \"input_data\": object passed to the agent, including its \"operation\"\n\
  \"dependencies\": array of zero-based indices of earlier steps this step \
needs completed first (omit when empty)\n\
Dependencies may only reference earlier steps.\n\n\
Available agents and their operations:\n{capability_lines}"
    );

    vec![PromptMessage::system(system), PromptMessage::user(goal)]
}
