//! Progress tracking for the ingestion pipeline.
//!
//! The pipeline only exposes polling endpoints. [`ProgressClient`] talks to
//! them, [`TaskPoller`] follows one task to completion and
//! [`BatchTracker`] follows a set of tasks uploaded together.

mod batch;
mod client;
mod error;
mod poller;

use async_trait::async_trait;

use docrelay_protocol::{ClearTaskResponse, ProgressRecord};

pub use batch::{BatchSnapshot, BatchTracker, BatchUpdate};
pub use client::ProgressClient;
pub use error::{TrackerError, TrackerResult};
pub use poller::{PollConfig, TaskPoller, TaskUpdate};

/// Trait for progress queries (allows testing with mock implementations).
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn get_task_progress(&self, task_id: &str) -> TrackerResult<ProgressRecord>;
    async fn list_active_tasks(&self) -> TrackerResult<Vec<ProgressRecord>>;
    async fn clear_task(&self, task_id: &str) -> TrackerResult<ClearTaskResponse>;
}

#[async_trait]
impl ProgressSource for ProgressClient {
    async fn get_task_progress(&self, task_id: &str) -> TrackerResult<ProgressRecord> {
        ProgressClient::get_task_progress(self, task_id).await
    }

    async fn list_active_tasks(&self) -> TrackerResult<Vec<ProgressRecord>> {
        ProgressClient::list_active_tasks(self).await
    }

    async fn clear_task(&self, task_id: &str) -> TrackerResult<ClearTaskResponse> {
        ProgressClient::clear_task(self, task_id).await
    }
}
