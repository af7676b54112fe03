//! Foundational low-level utilities shared across Quill crates.
//!
//! Provides atomic file-write helpers, time utilities, and the monotonic id
//! scheme used for tasks, messages, and goals.

pub mod atomic_io;
pub mod ids;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use ids::{new_goal_id, new_message_id, new_task_id};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
