use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use quill_task::{AgentMessage, AgentTask, AgentType};

use crate::cancellation::CancellationToken;
use crate::contract::{Agent, AgentError};

/// Default per-task execution deadline.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 120_000;
/// Default bound on a single `handle_message` call.
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 5_000;

const DEFAULT_INBOX_CAPACITY: usize = 64;
const SHUTDOWN_GRACE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Public struct `AgentWorkerConfig` used across Quill components.
pub struct AgentWorkerConfig {
    pub task_timeout_ms: u64,
    pub message_timeout_ms: u64,
    pub inbox_capacity: usize,
}

impl Default for AgentWorkerConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            message_timeout_ms: DEFAULT_MESSAGE_TIMEOUT_MS,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Terminal outcome of one task execution, reported to the coordinator.
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
    Cancelled(String),
}

#[derive(Debug, Clone)]
/// Completion report sent from an agent worker back to the coordinating loop.
pub struct TaskCompletion {
    pub task_id: String,
    pub agent_type: AgentType,
    pub outcome: TaskOutcome,
}

enum WorkerRequest {
    Execute { task: AgentTask },
    Notify { message: AgentMessage },
}

/// Handle to one spawned agent worker.
///
/// The worker processes its inbox serially: one task at a time, in the order
/// tasks were dispatched, with messages interleaved between them. Distinct
/// agents run concurrently; a single agent never executes two tasks at once.
pub struct AgentWorkerHandle {
    agent_type: AgentType,
    inbox: mpsc::Sender<WorkerRequest>,
    inbox_capacity: usize,
    cancellation: CancellationToken,
    active_tasks: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    dropped_messages: Arc<AtomicU64>,
    join: tokio::task::JoinHandle<()>,
}

impl AgentWorkerHandle {
    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Count of tasks currently executing (0 or 1 for a serial worker).
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of requests waiting in the worker's inbox.
    pub fn queue_depth(&self) -> usize {
        self.inbox_capacity.saturating_sub(self.inbox.capacity())
    }

    /// Messages discarded because the worker was stopped or its inbox full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Enqueues a task for execution. The completion report arrives on the
    /// channel the worker was spawned with.
    pub async fn dispatch(&self, task: AgentTask) -> Result<(), AgentError> {
        self.inbox
            .send(WorkerRequest::Execute { task })
            .await
            .map_err(|_| AgentError::NotRunning(self.agent_type))
    }

    /// Delivers a notification without blocking the caller.
    ///
    /// Returns false when the message was dropped (worker stopped or inbox
    /// full); drops are counted, never retried.
    pub fn notify(&self, message: AgentMessage) -> bool {
        match self.inbox.try_send(WorkerRequest::Notify { message }) {
            Ok(()) => true,
            Err(error) => {
                self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!(
                    agent_type = %self.agent_type,
                    error = %error,
                    "dropping inter-agent message"
                );
                false
            }
        }
    }

    /// Requests the worker stop. Idempotent; in-flight work observes the
    /// cancellation token at its next suspension point.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Stops the worker and waits for it to exit within a bounded grace
    /// period; a worker that overruns the grace period is left detached.
    pub async fn shutdown(self) {
        self.cancellation.cancel();
        let grace = Duration::from_millis(SHUTDOWN_GRACE_MS);
        let agent_type = self.agent_type;
        match tokio::time::timeout(grace, self.join).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    agent_type = %agent_type,
                    "agent worker did not stop within the grace period"
                );
            }
        }
    }
}

/// Spawns the worker loop for `agent`, reporting completions on
/// `completion_tx`.
pub fn spawn_agent_worker(
    agent: Arc<dyn Agent>,
    config: AgentWorkerConfig,
    completion_tx: mpsc::Sender<TaskCompletion>,
) -> AgentWorkerHandle {
    let agent_type = agent.agent_type();
    let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
    let cancellation = CancellationToken::new();
    let active_tasks = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicBool::new(true));
    let dropped_messages = Arc::new(AtomicU64::new(0));

    let join = tokio::spawn(worker_loop(
        agent,
        config,
        inbox_rx,
        completion_tx,
        cancellation.clone(),
        Arc::clone(&active_tasks),
        Arc::clone(&running),
    ));

    AgentWorkerHandle {
        agent_type,
        inbox: inbox_tx,
        inbox_capacity: config.inbox_capacity.max(1),
        cancellation,
        active_tasks,
        running,
        dropped_messages,
        join,
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    agent: Arc<dyn Agent>,
    config: AgentWorkerConfig,
    mut inbox_rx: mpsc::Receiver<WorkerRequest>,
    completion_tx: mpsc::Sender<TaskCompletion>,
    cancellation: CancellationToken,
    active_tasks: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
) {
    let agent_type = agent.agent_type();
    loop {
        let request = tokio::select! {
            _ = cancellation.cancelled() => None,
            request = inbox_rx.recv() => request,
        };
        let Some(request) = request else {
            break;
        };
        match request {
            WorkerRequest::Execute { task } => {
                let task_id = task.id.clone();
                active_tasks.fetch_add(1, Ordering::SeqCst);
                let outcome = run_task(agent.as_ref(), &task, &config, &cancellation).await;
                active_tasks.fetch_sub(1, Ordering::SeqCst);
                let report = TaskCompletion {
                    task_id,
                    agent_type,
                    outcome,
                };
                if completion_tx.send(report).await.is_err() {
                    // Coordinator gone; nothing left to report to.
                    break;
                }
            }
            WorkerRequest::Notify { message } => {
                let deadline = Duration::from_millis(config.message_timeout_ms.max(1));
                match tokio::time::timeout(deadline, agent.handle_message(&message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        warn!(
                            agent_type = %agent_type,
                            message_id = %message.id,
                            error = %error,
                            "message handler returned an error"
                        );
                    }
                    Err(_) => {
                        warn!(
                            agent_type = %agent_type,
                            message_id = %message.id,
                            timeout_ms = config.message_timeout_ms,
                            "message handler exceeded its timeout"
                        );
                    }
                }
            }
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!(agent_type = %agent_type, "agent worker stopped");
}

async fn run_task(
    agent: &dyn Agent,
    task: &AgentTask,
    config: &AgentWorkerConfig,
    cancellation: &CancellationToken,
) -> TaskOutcome {
    if cancellation.is_cancelled() {
        return TaskOutcome::Cancelled("worker stopped before execution".to_string());
    }
    let deadline = Duration::from_millis(config.task_timeout_ms.max(1));
    tokio::select! {
        _ = cancellation.cancelled() => TaskOutcome::Cancelled(format!(
            "cancelled while task '{}' was in flight",
            task.id
        )),
        result = tokio::time::timeout(deadline, agent.execute_task(task)) => match result {
            Ok(Ok(value)) => TaskOutcome::Completed(value),
            Ok(Err(error)) => TaskOutcome::Failed(error.to_string()),
            Err(_) => TaskOutcome::Failed(format!(
                "task timed out after {}ms",
                config.task_timeout_ms
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use quill_task::{AgentMessage, AgentTask, AgentType};

    use crate::contract::{Agent, AgentCapability, AgentError};

    use super::{spawn_agent_worker, AgentWorkerConfig, TaskOutcome};

    struct StubAgent {
        agent_type: AgentType,
        delay_ms: u64,
        message_delay_ms: u64,
        fail_with: Option<String>,
        executed: Arc<Mutex<Vec<String>>>,
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl StubAgent {
        fn new(agent_type: AgentType) -> Self {
            Self {
                agent_type,
                delay_ms: 0,
                message_delay_ms: 0,
                fail_with: None,
                executed: Arc::new(Mutex::new(Vec::new())),
                messages: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn agent_type(&self) -> AgentType {
            self.agent_type
        }

        async fn initialize(&self) -> Result<Vec<AgentCapability>, AgentError> {
            Ok(Vec::new())
        }

        async fn execute_task(&self, task: &AgentTask) -> Result<Value, AgentError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.executed
                .lock()
                .expect("executed lock")
                .push(task.id.clone());
            match &self.fail_with {
                Some(reason) => Err(AgentError::InvalidInput(reason.clone())),
                None => Ok(json!({ "task": task.id })),
            }
        }

        async fn handle_message(&self, message: &AgentMessage) -> Result<(), AgentError> {
            if self.message_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.message_delay_ms)).await;
            }
            self.messages
                .lock()
                .expect("messages lock")
                .push(message.id.clone());
            Ok(())
        }
    }

    fn fast_config() -> AgentWorkerConfig {
        AgentWorkerConfig {
            task_timeout_ms: 1_000,
            message_timeout_ms: 100,
            inbox_capacity: 8,
        }
    }

    #[tokio::test]
    async fn functional_worker_executes_tasks_serially_in_fifo_order() {
        let agent = Arc::new(StubAgent::new(AgentType::Retrieval));
        let executed = Arc::clone(&agent.executed);
        let (completion_tx, mut completion_rx) = mpsc::channel(8);
        let handle = spawn_agent_worker(agent, fast_config(), completion_tx);

        let first = AgentTask::new(AgentType::Retrieval, "first");
        let second = AgentTask::new(AgentType::Retrieval, "second");
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        handle.dispatch(first).await.expect("dispatch first");
        handle.dispatch(second).await.expect("dispatch second");

        let report_one = completion_rx.recv().await.expect("first report");
        let report_two = completion_rx.recv().await.expect("second report");
        assert_eq!(report_one.task_id, first_id);
        assert_eq!(report_two.task_id, second_id);
        assert!(matches!(report_one.outcome, TaskOutcome::Completed(_)));
        assert_eq!(
            *executed.lock().expect("executed"),
            vec![first_id, second_id]
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn functional_worker_converts_agent_fault_into_failed_outcome() {
        let mut stub = StubAgent::new(AgentType::VaultManager);
        stub.fail_with = Some("note does not exist".to_string());
        let (completion_tx, mut completion_rx) = mpsc::channel(8);
        let handle = spawn_agent_worker(Arc::new(stub), fast_config(), completion_tx);

        handle
            .dispatch(AgentTask::new(AgentType::VaultManager, "read"))
            .await
            .expect("dispatch");
        let report = completion_rx.recv().await.expect("report");
        match report.outcome {
            TaskOutcome::Failed(reason) => assert!(reason.contains("note does not exist")),
            other => panic!("expected failed outcome, got {other:?}"),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn functional_worker_enforces_the_per_task_timeout() {
        let mut stub = StubAgent::new(AgentType::Context);
        stub.delay_ms = 5_000;
        let config = AgentWorkerConfig {
            task_timeout_ms: 20,
            ..fast_config()
        };
        let (completion_tx, mut completion_rx) = mpsc::channel(8);
        let handle = spawn_agent_worker(Arc::new(stub), config, completion_tx);

        handle
            .dispatch(AgentTask::new(AgentType::Context, "slow"))
            .await
            .expect("dispatch");
        let report = completion_rx.recv().await.expect("report");
        match report.outcome {
            TaskOutcome::Failed(reason) => assert!(reason.contains("timed out after 20ms")),
            other => panic!("expected timeout failure, got {other:?}"),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn functional_cancellation_interrupts_an_in_flight_task() {
        let mut stub = StubAgent::new(AgentType::Memory);
        stub.delay_ms = 5_000;
        let (completion_tx, mut completion_rx) = mpsc::channel(8);
        let handle = spawn_agent_worker(Arc::new(stub), fast_config(), completion_tx);

        handle
            .dispatch(AgentTask::new(AgentType::Memory, "long store"))
            .await
            .expect("dispatch");
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop();

        let report = completion_rx.recv().await.expect("report");
        assert!(matches!(report.outcome, TaskOutcome::Cancelled(_)));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn regression_slow_message_handler_does_not_stall_later_tasks() {
        let mut stub = StubAgent::new(AgentType::Memory);
        stub.message_delay_ms = 500;
        let received = Arc::clone(&stub.messages);
        let config = AgentWorkerConfig {
            message_timeout_ms: 20,
            ..fast_config()
        };
        let (completion_tx, mut completion_rx) = mpsc::channel(8);
        let handle = spawn_agent_worker(Arc::new(stub), config, completion_tx);

        let message = AgentMessage::broadcast(AgentType::Planner, json!("context updated"));
        assert!(handle.notify(message));
        let task = AgentTask::new(AgentType::Memory, "store after slow message");
        let task_id = task.id.clone();
        handle.dispatch(task).await.expect("dispatch");

        // The handler overruns its timeout; the queued task still runs.
        let report = completion_rx.recv().await.expect("report");
        assert_eq!(report.task_id, task_id);
        assert!(matches!(report.outcome, TaskOutcome::Completed(_)));
        // The timed-out handler never recorded the message.
        assert!(received.lock().expect("messages").is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn functional_notify_delivers_messages_and_counts_drops_after_stop() {
        let agent = Arc::new(StubAgent::new(AgentType::Retrieval));
        let received = Arc::clone(&agent.messages);
        let (completion_tx, _completion_rx) = mpsc::channel(8);
        let handle = spawn_agent_worker(agent, fast_config(), completion_tx);

        let message = AgentMessage::broadcast(AgentType::Planner, json!("plan ready"));
        let message_id = message.id.clone();
        assert!(handle.notify(message));

        // Wait for the worker to drain its inbox.
        for _ in 0..100 {
            if !received.lock().expect("messages").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*received.lock().expect("messages"), vec![message_id]);

        handle.stop();
        for _ in 0..100 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let late = AgentMessage::broadcast(AgentType::Planner, json!("late"));
        handle.notify(late);
        assert!(handle.dropped_messages() >= 1 || !handle.is_running());

        handle.shutdown().await;
    }
}
