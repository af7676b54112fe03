use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::AgentTask;

#[derive(Debug, Error, PartialEq, Eq)]
/// Enumerates supported `GraphValidationError` values.
pub enum GraphValidationError {
    #[error("task id '{task_id}' appears more than once in the graph")]
    DuplicateTaskId { task_id: String },
    #[error("task '{task_id}' depends on itself")]
    SelfDependency { task_id: String },
    #[error("task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency { task_id: String, dependency: String },
    #[error("dependency cycle detected involving tasks: {task_ids:?}")]
    CycleDetected { task_ids: Vec<String> },
}

#[derive(Debug, Clone, Default)]
/// The set of tasks plus dependency edges produced for one goal.
///
/// Owned by the orchestrator for the duration of one goal's execution and
/// discarded afterward; never persisted.
pub struct TaskGraph {
    tasks: Vec<AgentTask>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<AgentTask>) -> Self {
        Self { tasks }
    }

    pub fn tasks(&self) -> &[AgentTask] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<AgentTask> {
        self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Validates identity, dependency references, and acyclicity.
    ///
    /// Must pass before any task in the graph is dispatched; a failure
    /// rejects the whole submission.
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        let mut known_ids = BTreeSet::new();
        for task in &self.tasks {
            if !known_ids.insert(task.id.as_str()) {
                return Err(GraphValidationError::DuplicateTaskId {
                    task_id: task.id.clone(),
                });
            }
        }

        for task in &self.tasks {
            for dependency in &task.dependencies {
                if dependency == &task.id {
                    return Err(GraphValidationError::SelfDependency {
                        task_id: task.id.clone(),
                    });
                }
                if !known_ids.contains(dependency.as_str()) {
                    return Err(GraphValidationError::UnknownDependency {
                        task_id: task.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the dependency edges; leftover nodes form a cycle.
    fn check_acyclic(&self) -> Result<(), GraphValidationError> {
        let mut remaining_deps: BTreeMap<&str, BTreeSet<&str>> = self
            .tasks
            .iter()
            .map(|task| {
                (
                    task.id.as_str(),
                    task.dependencies
                        .iter()
                        .map(String::as_str)
                        .collect::<BTreeSet<_>>(),
                )
            })
            .collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for task in &self.tasks {
            for dependency in &task.dependencies {
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(task.id.as_str());
            }
        }

        let mut ready: Vec<&str> = remaining_deps
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        while let Some(finished) = ready.pop() {
            remaining_deps.remove(finished);
            for dependent in dependents.remove(finished).unwrap_or_default() {
                if let Some(deps) = remaining_deps.get_mut(dependent) {
                    deps.remove(finished);
                    if deps.is_empty() {
                        ready.push(dependent);
                    }
                }
            }
        }

        if remaining_deps.is_empty() {
            return Ok(());
        }
        Err(GraphValidationError::CycleDetected {
            task_ids: remaining_deps
                .into_keys()
                .map(ToString::to_string)
                .collect(),
        })
    }
}
