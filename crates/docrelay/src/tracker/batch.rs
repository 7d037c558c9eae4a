//! Polling watcher for a set of tasks uploaded together.

use std::sync::Arc;

use futures::Stream;
use futures::future::join_all;
use log::{debug, warn};
use serde::Serialize;
use tokio::time::Interval;

use docrelay_protocol::{BatchRecord, ProgressRecord, RawProgress};

use super::ProgressSource;
use super::error::TrackerError;
use super::poller::{PollConfig, ticker};

const NO_LONGER_TRACKED: &str = "Task is no longer tracked";

/// Aggregate plus the member records it was computed from, in member order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSnapshot {
    pub batch: BatchRecord,
    pub tasks: Vec<ProgressRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchUpdate {
    Snapshot(BatchSnapshot),
    /// Every member is terminal. Last update.
    Finished(BatchSnapshot),
    /// Last update.
    Unauthorized,
    /// No member could be polled for several ticks. Polling continues.
    Stalled { failures: u32, reason: String },
}

impl BatchUpdate {
    pub fn is_final(&self) -> bool {
        matches!(self, BatchUpdate::Finished(_) | BatchUpdate::Unauthorized)
    }
}

/// Tracks several tasks as one batch.
///
/// Members are polled concurrently on every tick; members that reached a
/// terminal state are not queried again.
pub struct BatchTracker {
    source: Arc<dyn ProgressSource>,
    config: PollConfig,
    batch_id: String,
    task_ids: Vec<String>,
}

struct BatchState {
    tracker: BatchTracker,
    interval: Option<Interval>,
    members: Vec<Option<ProgressRecord>>,
    /// Highest processing percentage seen per member.
    high_water: Vec<u8>,
    last: Option<BatchSnapshot>,
    failures: u32,
    stalled: bool,
    finished: bool,
}

impl BatchTracker {
    pub fn new(
        source: Arc<dyn ProgressSource>,
        config: PollConfig,
        batch_id: impl Into<String>,
        task_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut ids: Vec<String> = Vec::new();
        for id in task_ids.into_iter().map(Into::into) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Self {
            source,
            config,
            batch_id: batch_id.into(),
            task_ids: ids,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    /// Snapshots whenever the batch changes, ending with `Finished` once
    /// every member is terminal.
    pub fn watch(self) -> impl Stream<Item = BatchUpdate> + Send + 'static {
        let members = vec![None; self.task_ids.len()];
        let high_water = vec![0; self.task_ids.len()];
        let state = BatchState {
            tracker: self,
            interval: None,
            members,
            high_water,
            last: None,
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

impl BatchState {
    fn placeholder(&self, task_id: &str, status: &str, error: Option<&str>) -> ProgressRecord {
        ProgressRecord::normalize(
            task_id,
            RawProgress {
                batch_id: Some(self.tracker.batch_id.clone()),
                status: Some(status.to_string()),
                error_message: error.map(str::to_string),
                ..Default::default()
            },
            self.tracker.config.default_total_steps,
        )
    }

    fn snapshot(&self) -> BatchSnapshot {
        let tasks: Vec<ProgressRecord> = self.members.iter().flatten().cloned().collect();
        BatchSnapshot {
            batch: BatchRecord::aggregate(self.tracker.batch_id.clone(), &tasks),
            tasks,
        }
    }

    async fn next_update(&mut self) -> BatchUpdate {
        let period = self.tracker.config.interval;

        loop {
            self.interval
                .get_or_insert_with(|| ticker(period))
                .tick()
                .await;

            let pending: Vec<usize> = (0..self.members.len())
                .filter(|&i| !self.members[i].as_ref().is_some_and(|r| r.is_terminal()))
                .collect();

            let source = &self.tracker.source;
            let results = join_all(pending.iter().map(|&i| {
                let task_id = &self.tracker.task_ids[i];
                async move { (i, source.get_task_progress(task_id).await) }
            }))
            .await;

            let mut answered = pending.is_empty();
            let mut last_error: Option<TrackerError> = None;
            for (i, result) in results {
                let task_id = self.tracker.task_ids[i].clone();
                match result {
                    Ok(mut record) => {
                        answered = true;
                        record.hold_progress(self.high_water[i]);
                        self.high_water[i] = record.progress_floor(self.high_water[i]);
                        self.members[i] = Some(record);
                    }
                    Err(TrackerError::Unauthorized) => return BatchUpdate::Unauthorized,
                    Err(TrackerError::NotFound(_)) => {
                        answered = true;
                        debug!("batch {}: member {} is gone", self.tracker.batch_id, task_id);
                        self.members[i] =
                            Some(self.placeholder(&task_id, "failed", Some(NO_LONGER_TRACKED)));
                    }
                    Err(err) => {
                        warn!(
                            "batch {}: progress poll for {} failed: {}",
                            self.tracker.batch_id, task_id, err
                        );
                        if self.members[i].is_none() {
                            self.members[i] = Some(self.placeholder(&task_id, "pending", None));
                        }
                        last_error = Some(err);
                    }
                }
            }

            let recovered = if answered {
                self.failures = 0;
                std::mem::take(&mut self.stalled)
            } else {
                self.failures += 1;
                if !self.stalled && self.failures >= self.tracker.config.stall_after_failures {
                    self.stalled = true;
                    return BatchUpdate::Stalled {
                        failures: self.failures,
                        reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
                    };
                }
                false
            };

            let snapshot = self.snapshot();
            if snapshot.batch.is_complete() {
                return BatchUpdate::Finished(snapshot);
            }
            if !recovered && self.last.as_ref() == Some(&snapshot) {
                continue;
            }
            self.last = Some(snapshot.clone());
            return BatchUpdate::Snapshot(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::poller::tests::{Scripted, api_error, record};
    use docrelay_protocol::{BatchStatus, TaskStatus};
    use futures::StreamExt;
    use std::sync::atomic::Ordering;

    fn tracker(source: Scripted, ids: &[&str]) -> (BatchTracker, Arc<Scripted>) {
        let source = Arc::new(source);
        let tracker = BatchTracker::new(
            source.clone(),
            PollConfig::default(),
            "b1",
            ids.iter().copied(),
        );
        (tracker, source)
    }

    fn assert_counts_add_up(batch: &BatchRecord) {
        assert_eq!(
            batch.completed_count + batch.failed_count + batch.queued_count + batch.processing_count,
            batch.total_files
        );
        assert_eq!(
            batch.batch_status == BatchStatus::Completed,
            batch.processing_count == 0 && batch.queued_count == 0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn aggregates_until_every_member_is_terminal() {
        let source = Scripted::default()
            .script(
                "a",
                vec![
                    Ok(record("a", "processing", 50.0)),
                    Ok(record("a", "completed", 100.0)),
                ],
            )
            .script(
                "b",
                vec![
                    Ok(record("b", "queued", 0.0)),
                    Ok(record("b", "processing", 40.0)),
                    Ok(record("b", "failed", 40.0)),
                ],
            );
        let (tracker, source) = tracker(source, &["a", "b", "a"]);
        assert_eq!(tracker.task_ids().len(), 2);

        let updates: Vec<BatchUpdate> = tracker.watch().collect().await;
        for update in &updates {
            if let BatchUpdate::Snapshot(s) | BatchUpdate::Finished(s) = update {
                assert_counts_add_up(&s.batch);
            }
        }
        let Some(BatchUpdate::Finished(last)) = updates.last() else {
            panic!("expected a finished batch, got {updates:?}");
        };
        assert_eq!(last.batch.completed_count, 1);
        assert_eq!(last.batch.failed_count, 1);
        assert_eq!(last.batch.overall_percent, 100);
        // a: 2 polls, b: 3 polls; terminal members are not polled again.
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn member_progress_survives_a_requeue() {
        let source = Scripted::default().script(
            "a",
            vec![
                Ok(record("a", "processing", 70.0)),
                Ok(record("a", "pending", 0.0)),
                Ok(record("a", "processing", 40.0)),
                Ok(record("a", "completed", 100.0)),
            ],
        );
        let (tracker, _) = tracker(source, &["a"]);

        let updates: Vec<BatchUpdate> = tracker.watch().collect().await;
        let processing: Vec<u8> = updates
            .iter()
            .filter_map(|u| match u {
                BatchUpdate::Snapshot(s) => s
                    .tasks
                    .first()
                    .filter(|r| r.status == TaskStatus::Processing)
                    .map(|r| r.progress_percent),
                _ => None,
            })
            .collect();
        assert_eq!(processing, vec![70, 70]);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_member_counts_as_failed() {
        let source = Scripted::default().script("a", vec![Ok(record("a", "completed", 100.0))]);
        let (tracker, _) = tracker(source, &["a", "ghost"]);

        let updates: Vec<BatchUpdate> = tracker.watch().collect().await;
        let Some(BatchUpdate::Finished(last)) = updates.last() else {
            panic!("expected a finished batch, got {updates:?}");
        };
        let ghost = &last.tasks[1];
        assert_eq!(ghost.status, TaskStatus::Failed);
        assert_eq!(ghost.error_message.as_deref(), Some(NO_LONGER_TRACKED));
        assert_eq!(last.batch.failed_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_members_are_pending_then_stall() {
        let source = Scripted::default()
            .script(
                "a",
                vec![
                    Err(api_error()),
                    Err(api_error()),
                    Err(api_error()),
                    Ok(record("a", "completed", 100.0)),
                ],
            );
        let (tracker, _) = tracker(source, &["a"]);

        let updates: Vec<BatchUpdate> = tracker.watch().collect().await;
        let BatchUpdate::Snapshot(first) = &updates[0] else {
            panic!("expected a snapshot, got {updates:?}");
        };
        assert_eq!(first.batch.queued_count, 1);
        assert!(matches!(updates[1], BatchUpdate::Stalled { failures: 3, .. }));
        assert!(matches!(updates.last(), Some(BatchUpdate::Finished(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_ends_the_batch() {
        let source = Scripted::default()
            .script("a", vec![Ok(record("a", "processing", 10.0))])
            .script("b", vec![Err(TrackerError::Unauthorized)]);
        let (tracker, _) = tracker(source, &["a", "b"]);

        let updates: Vec<BatchUpdate> = tracker.watch().collect().await;
        assert_eq!(updates, vec![BatchUpdate::Unauthorized]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_finishes_immediately() {
        let (tracker, source) = tracker(Scripted::default(), &[]);
        let updates: Vec<BatchUpdate> = tracker.watch().collect().await;
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_final());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
