use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use quill_agent::{
    spawn_agent_worker, Agent, AgentWorkerConfig, AgentWorkerHandle, TaskCompletion, TaskOutcome,
};
use quill_core::new_goal_id;
use quill_planner::{CapabilityUnion, PlanParseError, Planner};
use quill_task::{
    AgentMessage, AgentTask, AgentType, GraphValidationError, TaskGraph, TaskStatus,
};

use crate::events::{DispatchEvent, DispatchEventLog};
use crate::status::{AgentStatus, OrchestratorStatus};

#[derive(Debug, Error)]
/// Enumerates supported `OrchestratorError` values.
pub enum OrchestratorError {
    #[error("no agent registered for agent type '{0}'")]
    UnknownAgentType(AgentType),
    #[error("task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency { task_id: String, dependency: String },
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("unknown goal '{0}'")]
    UnknownGoal(String),
    #[error("goal '{0}' is already active")]
    DuplicateGoalId(String),
    #[error(transparent)]
    Graph(#[from] GraphValidationError),
    #[error(transparent)]
    Plan(#[from] PlanParseError),
    #[error("no planner is configured")]
    PlannerUnavailable,
    #[error("orchestrator is stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
/// Public struct `OrchestratorConfig` used across Quill components.
pub struct OrchestratorConfig {
    pub worker: AgentWorkerConfig,
    /// JSONL log of dispatch decisions; `None` disables the log.
    pub events_log_path: Option<PathBuf>,
    /// Atomic status snapshot for external health checks; `None` disables it.
    pub status_snapshot_path: Option<PathBuf>,
    pub command_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker: AgentWorkerConfig::default(),
            events_log_path: None,
            status_snapshot_path: None,
            command_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Terminal state of one task as seen by the goal's caller.
pub struct TaskReport {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Complete result map for one executed goal.
pub struct GoalReport {
    pub goal_id: String,
    pub reports: BTreeMap<String, TaskReport>,
}

enum Command {
    SubmitTask {
        task: AgentTask,
        reply: oneshot::Sender<Result<String, OrchestratorError>>,
    },
    SubmitGoal {
        goal_id: String,
        graph: TaskGraph,
        done: oneshot::Sender<Result<BTreeMap<String, TaskReport>, OrchestratorError>>,
    },
    AwaitTask {
        task_id: String,
        reply: oneshot::Sender<Result<TaskReport, OrchestratorError>>,
    },
    CancelGoal {
        goal_id: String,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    GetStatus {
        reply: oneshot::Sender<OrchestratorStatus>,
    },
    Broadcast {
        message: AgentMessage,
    },
    Shutdown,
}

/// Registers agents, initializes them, and starts the coordinating loop.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    agents: Vec<Arc<dyn Agent>>,
    planner: Option<Arc<Planner>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            agents: Vec::new(),
            planner: None,
        }
    }

    pub fn register_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_planner(mut self, planner: Arc<Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Initializes every registered agent and spawns the coordinator.
    ///
    /// Agent initialization failure is isolated: the failed agent is left
    /// out of the routing table and the rest keep running.
    pub async fn start(self) -> Orchestrator {
        let mut agents = self.agents;
        if let Some(planner) = &self.planner {
            agents.push(Arc::clone(planner) as Arc<dyn Agent>);
        }

        // Sized so no worker can block reporting a completion while the
        // coordinator is itself blocked dispatching into a full inbox.
        let completion_capacity = agents
            .len()
            .saturating_mul(self.config.worker.inbox_capacity)
            .saturating_add(16);
        let (completion_tx, completion_rx) = mpsc::channel(completion_capacity);

        let mut workers = BTreeMap::new();
        let mut capabilities = CapabilityUnion::new();
        for agent in agents {
            let agent_type = agent.agent_type();
            match agent.initialize().await {
                Ok(declared) => {
                    let handle = spawn_agent_worker(
                        Arc::clone(&agent),
                        self.config.worker,
                        completion_tx.clone(),
                    );
                    workers.insert(agent_type, handle);
                    capabilities.insert(agent_type, declared);
                    info!(agent_type = %agent_type, "agent registered");
                }
                Err(error) => {
                    warn!(
                        agent_type = %agent_type,
                        error = %error,
                        "agent failed to initialize and was marked unavailable"
                    );
                }
            }
        }

        if let Some(planner) = &self.planner {
            planner.set_capability_union(planning_union(&capabilities));
        }

        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let coordinator = Coordinator {
            workers,
            command_rx,
            completion_rx,
            tasks: BTreeMap::new(),
            dependents: BTreeMap::new(),
            goals: BTreeMap::new(),
            waiters: BTreeMap::new(),
            events: DispatchEventLog::new(self.config.events_log_path.clone()),
            status_snapshot_path: self.config.status_snapshot_path.clone(),
        };
        let join = tokio::spawn(coordinator.run());

        Orchestrator {
            command_tx,
            planner: self.planner,
            capabilities: Arc::new(capabilities),
            join: Arc::new(Mutex::new(Some(join))),
        }
    }
}

/// Handle to a running orchestrator. Cheap to clone; every clone talks to
/// the same coordinating loop.
#[derive(Clone)]
pub struct Orchestrator {
    command_tx: mpsc::Sender<Command>,
    planner: Option<Arc<Planner>>,
    capabilities: Arc<CapabilityUnion>,
    join: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Orchestrator {
    /// Capability union of every successfully initialized agent.
    pub fn capabilities(&self) -> &CapabilityUnion {
        &self.capabilities
    }

    /// Enqueues a single task; returns its id once accepted.
    pub async fn submit_task(&self, task: AgentTask) -> Result<String, OrchestratorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::SubmitTask {
                task,
                reply: reply_tx,
            })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        reply_rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Resolves once the task reaches a terminal status. Delivering the
    /// report claims it: the task's record is discarded afterwards, so a
    /// second await of the same id returns `UnknownTask`.
    pub async fn await_task(&self, task_id: &str) -> Result<TaskReport, OrchestratorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::AwaitTask {
                task_id: task_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        reply_rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Submits one task and blocks until it is terminal.
    pub async fn run_task(&self, task: AgentTask) -> Result<TaskReport, OrchestratorError> {
        let task_id = self.submit_task(task).await?;
        self.await_task(&task_id).await
    }

    /// Plans and executes a goal, blocking until every task is terminal.
    ///
    /// Always returns a complete report map: every task in the planned graph
    /// appears with a terminal status, cancelled ones with a reason.
    pub async fn execute_goal(&self, goal: &str) -> Result<GoalReport, OrchestratorError> {
        self.execute_goal_with_id(&new_goal_id(), goal).await
    }

    /// Like [`Orchestrator::execute_goal`] with a caller-chosen goal id, so
    /// the caller can cancel the goal from another handle while it runs.
    pub async fn execute_goal_with_id(
        &self,
        goal_id: &str,
        goal: &str,
    ) -> Result<GoalReport, OrchestratorError> {
        let planner = self
            .planner
            .as_ref()
            .ok_or(OrchestratorError::PlannerUnavailable)?;
        let union = planning_union(&self.capabilities);
        let graph = planner.plan(goal, &union).await?;
        graph.validate()?;

        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(Command::SubmitGoal {
                goal_id: goal_id.to_string(),
                graph,
                done: done_tx,
            })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        let reports = done_rx.await.map_err(|_| OrchestratorError::Stopped)??;
        Ok(GoalReport {
            goal_id: goal_id.to_string(),
            reports,
        })
    }

    /// Submits an already-built task graph as one goal.
    pub async fn execute_graph(
        &self,
        goal_id: &str,
        graph: TaskGraph,
    ) -> Result<GoalReport, OrchestratorError> {
        graph.validate()?;
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(Command::SubmitGoal {
                goal_id: goal_id.to_string(),
                graph,
                done: done_tx,
            })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        let reports = done_rx.await.map_err(|_| OrchestratorError::Stopped)??;
        Ok(GoalReport {
            goal_id: goal_id.to_string(),
            reports,
        })
    }

    /// Cancels every non-terminal task of a goal.
    ///
    /// Pending tasks become `Cancelled` immediately; in-flight tasks are
    /// observed at their next suspension point and their results discarded.
    pub async fn cancel_goal(&self, goal_id: &str) -> Result<(), OrchestratorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::CancelGoal {
                goal_id: goal_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        reply_rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Per-agent health snapshot.
    pub async fn get_status(&self) -> Result<OrchestratorStatus, OrchestratorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::GetStatus { reply: reply_tx })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        reply_rx.await.map_err(|_| OrchestratorError::Stopped)
    }

    /// Delivers a message to every addressed agent's inbox, best effort.
    pub async fn broadcast(&self, message: AgentMessage) -> Result<(), OrchestratorError> {
        self.command_tx
            .send(Command::Broadcast { message })
            .await
            .map_err(|_| OrchestratorError::Stopped)
    }

    /// Stops the coordinator and every agent worker.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
        let join = {
            let mut slot = match self.join.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

fn planning_union(capabilities: &CapabilityUnion) -> CapabilityUnion {
    capabilities
        .iter()
        .filter(|(agent_type, _)| **agent_type != AgentType::Planner)
        .map(|(agent_type, declared)| (*agent_type, declared.clone()))
        .collect()
}

struct TaskEntry {
    task: AgentTask,
    goal_id: Option<String>,
    reported: bool,
    /// A standalone task's report has been delivered to a waiter; its record
    /// can be released once dependents are settled.
    claimed: bool,
}

struct GoalState {
    task_ids: BTreeSet<String>,
    remaining: usize,
    cancelling: bool,
    done: Option<oneshot::Sender<Result<BTreeMap<String, TaskReport>, OrchestratorError>>>,
}

/// The single coordinating loop. Owns all task, goal, and dependency state;
/// nothing else mutates it.
struct Coordinator {
    workers: BTreeMap<AgentType, AgentWorkerHandle>,
    command_rx: mpsc::Receiver<Command>,
    completion_rx: mpsc::Receiver<TaskCompletion>,
    tasks: BTreeMap<String, TaskEntry>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    goals: BTreeMap<String, GoalState>,
    waiters: BTreeMap<String, Vec<oneshot::Sender<Result<TaskReport, OrchestratorError>>>>,
    events: DispatchEventLog,
    status_snapshot_path: Option<PathBuf>,
}

enum DependencyState {
    Ready,
    Waiting,
    Blocked { dependency: String },
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                completion = self.completion_rx.recv() => match completion {
                    None => break,
                    Some(completion) => self.handle_completion(completion).await,
                },
            }
        }
        self.persist_status_snapshot();
        for (_, worker) in std::mem::take(&mut self.workers) {
            worker.shutdown().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SubmitTask { task, reply } => {
                let accepted = self.accept_task(task, None);
                match accepted {
                    Ok(task_id) => {
                        let _ = reply.send(Ok(task_id.clone()));
                        self.try_dispatch(&task_id).await;
                        self.settle_goals();
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
            Command::SubmitGoal {
                goal_id,
                graph,
                done,
            } => {
                if !self.accept_goal(&goal_id, graph, done) {
                    return;
                }
                let task_ids: Vec<String> = self
                    .goals
                    .get(&goal_id)
                    .map(|goal| goal.task_ids.iter().cloned().collect())
                    .unwrap_or_default();
                for task_id in task_ids {
                    self.try_dispatch(&task_id).await;
                }
                self.settle_goals();
            }
            Command::AwaitTask { task_id, reply } => match self.tasks.get(&task_id) {
                Some(entry) if entry.task.status.is_terminal() => {
                    let standalone = entry.goal_id.is_none();
                    let _ = reply.send(Ok(report_of(&entry.task)));
                    if standalone {
                        self.release_task(&task_id);
                    }
                }
                Some(_) => {
                    self.waiters.entry(task_id).or_default().push(reply);
                }
                None => {
                    let _ = reply.send(Err(OrchestratorError::UnknownTask(task_id)));
                }
            },
            Command::CancelGoal { goal_id, reply } => {
                let result = self.cancel_goal(&goal_id);
                let _ = reply.send(result);
                self.settle_goals();
            }
            Command::GetStatus { reply } => {
                let _ = reply.send(self.build_status());
            }
            Command::Broadcast { message } => {
                for (agent_type, worker) in &self.workers {
                    if message.addressed_to(*agent_type) {
                        worker.notify(message.clone());
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn accept_task(
        &mut self,
        task: AgentTask,
        goal_id: Option<String>,
    ) -> Result<String, OrchestratorError> {
        if !self.workers.contains_key(&task.agent_type) {
            return Err(OrchestratorError::UnknownAgentType(task.agent_type));
        }
        for dependency in &task.dependencies {
            if !self.tasks.contains_key(dependency) {
                return Err(OrchestratorError::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        let task_id = task.id.clone();
        for dependency in &task.dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(task_id.clone());
        }
        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                task,
                goal_id,
                reported: false,
                claimed: false,
            },
        );
        Ok(task_id)
    }

    /// Registers a goal's graph; on rejection the error is delivered through
    /// `done` before any task is dispatched.
    fn accept_goal(
        &mut self,
        goal_id: &str,
        graph: TaskGraph,
        done: oneshot::Sender<Result<BTreeMap<String, TaskReport>, OrchestratorError>>,
    ) -> bool {
        if self.goals.contains_key(goal_id) {
            warn!(goal_id, "goal rejected before dispatch: id already active");
            let _ = done.send(Err(OrchestratorError::DuplicateGoalId(goal_id.to_string())));
            return false;
        }
        if let Err(error) = graph.validate() {
            warn!(goal_id, error = %error, "goal rejected before dispatch");
            let _ = done.send(Err(error.into()));
            return false;
        }
        for task in graph.tasks() {
            if !self.workers.contains_key(&task.agent_type) {
                warn!(
                    goal_id,
                    agent_type = %task.agent_type,
                    "goal rejected before dispatch: no agent registered"
                );
                let _ = done.send(Err(OrchestratorError::UnknownAgentType(task.agent_type)));
                return false;
            }
        }

        let tasks = graph.into_tasks();
        let mut task_ids = BTreeSet::new();
        let task_count = tasks.len();
        for task in tasks {
            let task_id = task.id.clone();
            // Graph dependencies were validated against the graph itself, so
            // registration cannot fail on membership.
            for dependency in &task.dependencies {
                self.dependents
                    .entry(dependency.clone())
                    .or_default()
                    .insert(task_id.clone());
            }
            self.tasks.insert(
                task_id.clone(),
                TaskEntry {
                    task,
                    goal_id: Some(goal_id.to_string()),
                    reported: false,
                    claimed: false,
                },
            );
            task_ids.insert(task_id);
        }
        self.goals.insert(
            goal_id.to_string(),
            GoalState {
                task_ids,
                remaining: task_count,
                cancelling: false,
                done: Some(done),
            },
        );
        true
    }

    fn cancel_goal(&mut self, goal_id: &str) -> Result<(), OrchestratorError> {
        let Some(goal) = self.goals.get_mut(goal_id) else {
            return Err(OrchestratorError::UnknownGoal(goal_id.to_string()));
        };
        goal.cancelling = true;
        let task_ids: Vec<String> = goal.task_ids.iter().cloned().collect();
        for task_id in task_ids {
            let is_pending = self
                .tasks
                .get(&task_id)
                .map(|entry| entry.task.status == TaskStatus::Pending)
                .unwrap_or(false);
            if is_pending {
                if let Some(entry) = self.tasks.get_mut(&task_id) {
                    let _ = entry.task.cancel("goal cancelled");
                }
                self.record_terminal(&task_id);
            }
        }
        Ok(())
    }

    async fn handle_completion(&mut self, completion: TaskCompletion) {
        let TaskCompletion {
            task_id, outcome, ..
        } = completion;
        let goal_cancelling = self
            .tasks
            .get(&task_id)
            .and_then(|entry| entry.goal_id.as_ref())
            .and_then(|goal_id| self.goals.get(goal_id))
            .map(|goal| goal.cancelling)
            .unwrap_or(false);

        let Some(entry) = self.tasks.get_mut(&task_id) else {
            warn!(task_id, "completion for unknown task");
            return;
        };
        if entry.task.status != TaskStatus::InProgress {
            warn!(
                task_id,
                status = %entry.task.status,
                "dropping completion for a task that is not in progress"
            );
            return;
        }

        let transition = match outcome {
            // A cancelled goal discards even successful results.
            TaskOutcome::Completed(_) if goal_cancelling => entry.task.fail("goal cancelled"),
            TaskOutcome::Completed(value) => entry.task.complete(value),
            TaskOutcome::Failed(reason) => entry.task.fail(reason),
            TaskOutcome::Cancelled(reason) => entry.task.fail(format!("cancelled: {reason}")),
        };
        if let Err(error) = transition {
            warn!(task_id, error = %error, "illegal completion transition");
            return;
        }
        let completed = entry.task.status == TaskStatus::Completed;
        self.record_terminal(&task_id);

        let dependents: Vec<String> = self
            .dependents
            .get(&task_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if completed {
            for dependent_id in dependents {
                self.try_dispatch(&dependent_id).await;
            }
        } else {
            let status = self
                .tasks
                .get(&task_id)
                .map(|entry| entry.task.status)
                .unwrap_or(TaskStatus::Failed);
            for dependent_id in dependents {
                self.cancel_pending_with_cascade(
                    &dependent_id,
                    format!("dependency '{task_id}' ended {status}"),
                );
            }
        }
        self.settle_goals();
        self.release_if_claimed(&task_id);
    }

    /// Dispatches a pending task whose dependencies are all completed;
    /// cancels it (with cascade) when a dependency already ended badly.
    async fn try_dispatch(&mut self, task_id: &str) {
        let state = {
            let Some(entry) = self.tasks.get(task_id) else {
                return;
            };
            if entry.task.status != TaskStatus::Pending {
                return;
            }
            self.dependency_state(&entry.task)
        };
        match state {
            DependencyState::Waiting => {}
            DependencyState::Blocked { dependency } => {
                let status = self
                    .tasks
                    .get(&dependency)
                    .map(|entry| entry.task.status)
                    .unwrap_or(TaskStatus::Failed);
                self.cancel_pending_with_cascade(
                    task_id,
                    format!("dependency '{dependency}' ended {status}"),
                );
            }
            DependencyState::Ready => {
                let (agent_type, task_clone) = {
                    let Some(entry) = self.tasks.get_mut(task_id) else {
                        return;
                    };
                    if entry.task.begin().is_err() {
                        return;
                    }
                    (entry.task.agent_type, entry.task.clone())
                };
                self.append_event(
                    DispatchEvent::new("task_dispatched")
                        .task(task_id)
                        .agent(agent_type),
                );
                let dispatched = match self.workers.get(&agent_type) {
                    Some(worker) => worker.dispatch(task_clone).await.is_ok(),
                    None => false,
                };
                if !dispatched {
                    if let Some(entry) = self.tasks.get_mut(task_id) {
                        let _ = entry.task.fail("agent worker is not running");
                    }
                    self.record_terminal(task_id);
                    let dependents: Vec<String> = self
                        .dependents
                        .get(task_id)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default();
                    for dependent_id in dependents {
                        self.cancel_pending_with_cascade(
                            &dependent_id,
                            format!("dependency '{task_id}' ended failed"),
                        );
                    }
                    self.release_if_claimed(task_id);
                }
            }
        }
    }

    fn dependency_state(&self, task: &AgentTask) -> DependencyState {
        for dependency in &task.dependencies {
            match self.tasks.get(dependency).map(|entry| entry.task.status) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Pending) | Some(TaskStatus::InProgress) => {
                    return DependencyState::Waiting;
                }
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) | None => {
                    return DependencyState::Blocked {
                        dependency: dependency.clone(),
                    };
                }
            }
        }
        DependencyState::Ready
    }

    /// Transitively cancels pending dependents, recording each cancellation
    /// with a reason naming the dependency that triggered it.
    fn cancel_pending_with_cascade(&mut self, start: &str, reason: String) {
        let mut worklist = vec![(start.to_string(), reason)];
        while let Some((task_id, reason)) = worklist.pop() {
            let is_pending = self
                .tasks
                .get(&task_id)
                .map(|entry| entry.task.status == TaskStatus::Pending)
                .unwrap_or(false);
            if !is_pending {
                continue;
            }
            if let Some(entry) = self.tasks.get_mut(&task_id) {
                let _ = entry.task.cancel(reason);
            }
            self.record_terminal(&task_id);
            for dependent_id in self
                .dependents
                .get(&task_id)
                .map(|set| set.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
            {
                worklist.push((
                    dependent_id,
                    format!("dependency '{task_id}' ended cancelled"),
                ));
            }
            self.release_if_claimed(&task_id);
        }
    }

    /// One-shot terminal bookkeeping: event line, waiter wakeups, and the
    /// owning goal's countdown.
    fn record_terminal(&mut self, task_id: &str) {
        let (status, report, goal_id, agent_type) = {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                return;
            };
            if entry.reported || !entry.task.status.is_terminal() {
                return;
            }
            entry.reported = true;
            (
                entry.task.status,
                report_of(&entry.task),
                entry.goal_id.clone(),
                entry.task.agent_type,
            )
        };

        let event_kind = match status {
            TaskStatus::Completed => "task_completed",
            TaskStatus::Failed => "task_failed",
            TaskStatus::Cancelled => "task_cancelled",
            TaskStatus::Pending | TaskStatus::InProgress => unreachable!("terminal guard above"),
        };
        let mut event = DispatchEvent::new(event_kind).task(task_id).agent(agent_type);
        if let Some(goal_id) = &goal_id {
            event = event.goal(goal_id.clone());
        }
        if let Some(detail) = &report.error {
            event = event.detail(detail.clone());
        }
        self.append_event(event);

        let waiters = self.waiters.remove(task_id).unwrap_or_default();
        let delivered = !waiters.is_empty();
        for waiter in waiters {
            let _ = waiter.send(Ok(report.clone()));
        }
        if delivered && goal_id.is_none() {
            if let Some(entry) = self.tasks.get_mut(task_id) {
                entry.claimed = true;
            }
        }

        if let Some(goal_id) = goal_id {
            if let Some(goal) = self.goals.get_mut(&goal_id) {
                goal.remaining = goal.remaining.saturating_sub(1);
            }
        }
    }

    /// Completes every goal whose tasks are all terminal.
    fn settle_goals(&mut self) {
        let finished: Vec<String> = self
            .goals
            .iter()
            .filter(|(_, goal)| goal.remaining == 0 && goal.done.is_some())
            .map(|(goal_id, _)| goal_id.clone())
            .collect();
        for goal_id in finished {
            let Some(mut goal) = self.goals.remove(&goal_id) else {
                continue;
            };
            let reports: BTreeMap<String, TaskReport> = goal
                .task_ids
                .iter()
                .filter_map(|task_id| {
                    self.tasks
                        .get(task_id)
                        .map(|entry| (task_id.clone(), report_of(&entry.task)))
                })
                .collect();
            self.append_event(
                DispatchEvent::new("goal_completed")
                    .goal(goal_id.clone())
                    .detail(format!("{} tasks terminal", reports.len())),
            );
            if let Some(done) = goal.done.take() {
                let _ = done.send(Ok(reports));
            }
            for task_id in &goal.task_ids {
                self.release_task(task_id);
            }
            self.persist_status_snapshot();
        }
    }

    /// Drops a task's record and dependency edges once its report can no
    /// longer be requested.
    fn release_task(&mut self, task_id: &str) {
        let Some(entry) = self.tasks.remove(task_id) else {
            return;
        };
        for dependency in &entry.task.dependencies {
            if let Some(set) = self.dependents.get_mut(dependency) {
                set.remove(task_id);
                if set.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
        self.dependents.remove(task_id);
        self.waiters.remove(task_id);
    }

    fn release_if_claimed(&mut self, task_id: &str) {
        let claimed = self
            .tasks
            .get(task_id)
            .map(|entry| {
                entry.claimed && entry.goal_id.is_none() && entry.task.status.is_terminal()
            })
            .unwrap_or(false);
        if claimed {
            self.release_task(task_id);
        }
    }

    fn build_status(&self) -> OrchestratorStatus {
        let agents = self
            .workers
            .iter()
            .map(|(agent_type, worker)| AgentStatus {
                agent_type: *agent_type,
                running: worker.is_running(),
                active_tasks: worker.active_tasks(),
                queue_depth: worker.queue_depth(),
                dropped_messages: worker.dropped_messages(),
            })
            .collect();
        let pending_tasks = self
            .tasks
            .values()
            .filter(|entry| entry.task.status == TaskStatus::Pending)
            .count();
        let in_progress_tasks = self
            .tasks
            .values()
            .filter(|entry| entry.task.status == TaskStatus::InProgress)
            .count();
        OrchestratorStatus::new(agents, pending_tasks, in_progress_tasks, self.goals.len())
    }

    fn append_event(&self, event: DispatchEvent) {
        if let Err(error) = self.events.append(&event) {
            warn!(error = %error, "failed to append dispatch event");
        }
    }

    fn persist_status_snapshot(&self) {
        let Some(path) = &self.status_snapshot_path else {
            return;
        };
        if let Err(error) = self.build_status().persist(path) {
            warn!(error = %error, "failed to persist status snapshot");
        }
    }
}

fn report_of(task: &AgentTask) -> TaskReport {
    TaskReport {
        status: task.status,
        result: task.result.clone(),
        error: task.error.clone(),
    }
}
