//! Polling watcher for a single task.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use log::{debug, warn};
use serde::Serialize;
use tokio::time::{Interval, MissedTickBehavior};

use docrelay_protocol::{ProgressRecord, TaskStatus};

use super::ProgressSource;
use super::error::TrackerError;
use crate::config::TrackerConfig;
use crate::consumer::Notice;

/// Timing shared by task and batch watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Consecutive failed ticks before a stall is reported.
    pub stall_after_failures: u32,
    pub default_total_steps: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from(&TrackerConfig::default())
    }
}

impl From<&TrackerConfig> for PollConfig {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            stall_after_failures: config.stall_after_failures.max(1),
            default_total_steps: config.default_total_steps,
        }
    }
}

/// Build the tick source lazily: intervals must be created inside a runtime.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// What a task watcher reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskUpdate {
    /// The task moved.
    Progress(ProgressRecord),
    /// Several polls in a row failed. Polling continues.
    Stalled {
        task_id: String,
        failures: u32,
        reason: String,
    },
    /// The task reached `completed` or `failed`. Last update.
    Finished(ProgressRecord),
    /// The credential was rejected. Last update.
    Unauthorized,
    /// The upstream no longer knows the task. Last update.
    Missing { task_id: String },
}

impl TaskUpdate {
    pub fn is_final(&self) -> bool {
        !matches!(self, TaskUpdate::Progress(_) | TaskUpdate::Stalled { .. })
    }

    /// Message for the user, if this update warrants one.
    pub fn notice(&self) -> Option<Notice> {
        match self {
            TaskUpdate::Progress(_) => None,
            TaskUpdate::Stalled { .. } => Some(Notice::warning(
                "Progress updates are delayed. Still trying...",
            )),
            TaskUpdate::Finished(record) => Some(finished_notice(record)),
            TaskUpdate::Unauthorized => {
                Some(Notice::failure("Your session has expired. Please sign in again."))
            }
            TaskUpdate::Missing { task_id } => Some(Notice::failure(format!(
                "Task {task_id} is no longer tracked"
            ))),
        }
    }
}

fn finished_notice(record: &ProgressRecord) -> Notice {
    let subject = record.filename.as_deref().unwrap_or(&record.task_id);
    match record.status {
        TaskStatus::Failed => Notice::failure(match &record.error_message {
            Some(message) => format!("{subject}: {message}"),
            None => format!("{subject}: processing failed"),
        }),
        _ => Notice::info(format!("{subject}: processing complete")),
    }
}

/// Polls the progress endpoint of one task until it is terminal.
#[derive(Clone)]
pub struct TaskPoller {
    source: Arc<dyn ProgressSource>,
    config: PollConfig,
}

struct WatchState {
    source: Arc<dyn ProgressSource>,
    config: PollConfig,
    task_id: String,
    interval: Option<Interval>,
    last: Option<ProgressRecord>,
    /// Highest percentage reported while processing.
    high_water: u8,
    failures: u32,
    stalled: bool,
    finished: bool,
}

impl TaskPoller {
    pub fn new(source: Arc<dyn ProgressSource>, config: PollConfig) -> Self {
        Self { source, config }
    }

    /// Updates for `task_id`, starting with an immediate poll.
    ///
    /// Only changes are reported. Ticks never overlap: a slow poll delays the
    /// next one. The stream ends after its final update, and dropping it
    /// stops polling.
    pub fn watch(&self, task_id: impl Into<String>) -> impl Stream<Item = TaskUpdate> + Send + 'static {
        let state = WatchState {
            source: self.source.clone(),
            config: self.config,
            task_id: task_id.into(),
            interval: None,
            last: None,
            high_water: 0,
            failures: 0,
            stalled: false,
            finished: false,
        };
        futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            let update = state.next_update().await;
            state.finished = update.is_final();
            Some((update, state))
        })
    }
}

impl WatchState {
    async fn next_update(&mut self) -> TaskUpdate {
        let period = self.config.interval;
        let interval = self.interval.get_or_insert_with(|| ticker(period));

        loop {
            interval.tick().await;

            match self.source.get_task_progress(&self.task_id).await {
                Ok(mut record) => {
                    let recovered = std::mem::take(&mut self.stalled);
                    self.failures = 0;
                    record.hold_progress(self.high_water);
                    self.high_water = record.progress_floor(self.high_water);
                    if record.is_terminal() {
                        return TaskUpdate::Finished(record);
                    }
                    if !recovered && self.last.as_ref() == Some(&record) {
                        continue;
                    }
                    self.last = Some(record.clone());
                    return TaskUpdate::Progress(record);
                }
                Err(TrackerError::Unauthorized) => return TaskUpdate::Unauthorized,
                Err(TrackerError::NotFound(_)) => {
                    return TaskUpdate::Missing {
                        task_id: self.task_id.clone(),
                    };
                }
                Err(err) => {
                    self.failures += 1;
                    warn!(
                        "progress poll for {} failed ({} in a row): {}",
                        self.task_id, self.failures, err
                    );
                    if !self.stalled && self.failures >= self.config.stall_after_failures {
                        self.stalled = true;
                        return TaskUpdate::Stalled {
                            task_id: self.task_id.clone(),
                            failures: self.failures,
                            reason: err.to_string(),
                        };
                    }
                    debug!("treating failed poll for {} as transient", self.task_id);
                }
            }
        }
    }
}
