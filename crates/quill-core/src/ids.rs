use std::sync::atomic::{AtomicU64, Ordering};

use crate::time_utils::current_unix_timestamp_ms;

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);
static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(1);
static GOAL_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str, counter: &AtomicU64) -> String {
    let millis = current_unix_timestamp_ms();
    let count = counter.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{millis}-{count}")
}

/// Returns a process-unique task id.
pub fn new_task_id() -> String {
    next_id("quill-task", &TASK_COUNTER)
}

/// Returns a process-unique message id.
pub fn new_message_id() -> String {
    next_id("quill-msg", &MESSAGE_COUNTER)
}

/// Returns a process-unique goal id.
pub fn new_goal_id() -> String {
    next_id("quill-goal", &GOAL_COUNTER)
}
