//! JSON envelopes of the progress endpoints.
//!
//! The same shapes are used for what the pipeline API returns (with
//! [`RawProgress`] payloads) and for what the console API serves (with
//! normalized [`ProgressRecord`] payloads).

use serde::{Deserialize, Serialize};

use crate::progress::{ProgressRecord, RawProgress};

/// `GET tasks/{task_id}/progress`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgressResponse<P = RawProgress> {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub task_id: String,
    pub progress: P,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `GET tasks/active`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTasksResponse<P = RawProgress> {
    #[serde(default = "default_success")]
    pub success: bool,
    pub data: ActiveTasks<P>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTasks<P = RawProgress> {
    #[serde(default = "Vec::new")]
    pub active_tasks: Vec<P>,
    #[serde(default)]
    pub count: usize,
}

/// `DELETE tasks/{task_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearTaskResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

pub type NormalizedTaskProgress = TaskProgressResponse<ProgressRecord>;
pub type NormalizedActiveTasks = ActiveTasksResponse<ProgressRecord>;

impl NormalizedTaskProgress {
    pub fn new(record: ProgressRecord) -> Self {
        Self {
            success: true,
            task_id: record.task_id.clone(),
            progress: record,
            message: None,
        }
    }
}

impl NormalizedActiveTasks {
    pub fn new(records: Vec<ProgressRecord>) -> Self {
        Self {
            success: true,
            data: ActiveTasks {
                count: records.len(),
                active_tasks: records,
            },
            message: None,
        }
    }
}

fn default_success() -> bool {
    true
}
