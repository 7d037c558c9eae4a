//! HTTP request handlers.

mod misc;
mod relay;
mod tasks;

pub use misc::health;
pub use relay::relay;
pub use tasks::{active_batches, active_tasks, bearer_token, clear_task, task_progress};
