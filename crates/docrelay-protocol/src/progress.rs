//! Progress of ingestion tasks and batches.
//!
//! The pipeline reports progress loosely: percentages may be floats, stage
//! names vary between workers and step counts are usually missing.
//! [`ProgressRecord::normalize`] turns that into a record with the
//! following guarantees:
//!
//! - `progress_percent` is within `0..=100` and is `100` once completed
//! - `completed_steps <= total_steps`
//! - `stage` and `estimated_remaining_seconds` are only set while processing
//! - `error_message` is only set once failed

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One step per pipeline stage (upload, download, extract, chunk, embed,
/// storage).
pub const DEFAULT_TOTAL_STEPS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "waiting" => Ok(TaskStatus::Pending),
            "processing" | "running" | "in_progress" | "started" => Ok(TaskStatus::Processing),
            "completed" | "complete" | "done" | "success" | "succeeded" => {
                Ok(TaskStatus::Completed)
            }
            "failed" | "failure" | "error" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Upload,
    Download,
    Extract,
    Chunk,
    Embed,
    Storage,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Upload => "upload",
            PipelineStage::Download => "download",
            PipelineStage::Extract => "extract",
            PipelineStage::Chunk => "chunk",
            PipelineStage::Embed => "embed",
            PipelineStage::Storage => "storage",
        }
    }

    /// Label shown when the upstream sends no `current_step`.
    pub fn label(self) -> &'static str {
        match self {
            PipelineStage::Upload => "Uploading file",
            PipelineStage::Download => "Downloading source",
            PipelineStage::Extract => "Extracting text",
            PipelineStage::Chunk => "Splitting into chunks",
            PipelineStage::Embed => "Generating embeddings",
            PipelineStage::Storage => "Storing vectors",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upload" | "uploading" => Ok(PipelineStage::Upload),
            "download" | "downloading" | "fetch" => Ok(PipelineStage::Download),
            "extract" | "extracting" | "extraction" | "parse" | "parsing" => {
                Ok(PipelineStage::Extract)
            }
            "chunk" | "chunking" | "split" => Ok(PipelineStage::Chunk),
            "embed" | "embedding" | "embeddings" => Ok(PipelineStage::Embed),
            "storage" | "store" | "storing" | "index" | "indexing" => Ok(PipelineStage::Storage),
            other => Err(format!("unknown pipeline stage: {other}")),
        }
    }
}

/// Progress object as sent by the upstream. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProgress {
    pub task_id: Option<String>,
    pub batch_id: Option<String>,
    pub filename: Option<String>,
    pub status: Option<String>,
    pub stage: Option<String>,
    pub progress_percent: Option<f64>,
    pub current_step: Option<String>,
    pub completed_steps: Option<u32>,
    pub total_steps: Option<u32>,
    pub error_message: Option<String>,
    pub estimated_remaining_seconds: Option<f64>,
}

/// Normalized status snapshot of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
    pub progress_percent: u8,
    pub current_step: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<u64>,
}

impl ProgressRecord {
    /// Normalize an upstream progress object.
    ///
    /// `task_id` is used when the payload does not carry its own id.
    /// `default_total_steps` applies when the upstream sends no step count;
    /// zero falls back to [`DEFAULT_TOTAL_STEPS`].
    pub fn normalize(task_id: &str, raw: RawProgress, default_total_steps: u32) -> Self {
        let status = match raw.status.as_deref() {
            Some(text) => text.parse().unwrap_or_else(|err| {
                log::debug!("task {}: {}, treating as pending", task_id, err);
                TaskStatus::Pending
            }),
            None => TaskStatus::Pending,
        };

        let percent = match status {
            TaskStatus::Completed => 100,
            _ => clamp_percent(raw.progress_percent.unwrap_or(0.0)),
        };

        let total_steps = raw
            .total_steps
            .filter(|steps| *steps > 0)
            .unwrap_or(if default_total_steps > 0 {
                default_total_steps
            } else {
                DEFAULT_TOTAL_STEPS
            });
        let completed_steps = match (status, raw.completed_steps) {
            (TaskStatus::Completed, _) => total_steps,
            (_, Some(steps)) => steps.min(total_steps),
            (_, None) => steps_for_percent(percent, total_steps),
        };

        let processing = status == TaskStatus::Processing;
        let stage = raw
            .stage
            .as_deref()
            .filter(|_| processing)
            .and_then(|text| text.parse::<PipelineStage>().ok());

        let current_step = raw
            .current_step
            .filter(|step| !step.trim().is_empty())
            .unwrap_or_else(|| match (status, stage) {
                (TaskStatus::Processing, Some(stage)) => stage.label().to_string(),
                (TaskStatus::Processing, None) => "Processing".to_string(),
                (TaskStatus::Pending, _) => "Queued".to_string(),
                (TaskStatus::Completed, _) => "Completed".to_string(),
                (TaskStatus::Failed, _) => "Failed".to_string(),
            });

        let error_message = raw
            .error_message
            .filter(|_| status == TaskStatus::Failed)
            .filter(|msg| !msg.trim().is_empty());

        let estimated_remaining_seconds = raw
            .estimated_remaining_seconds
            .filter(|_| processing)
            .filter(|secs| secs.is_finite())
            .map(|secs| secs.max(0.0).round() as u64);

        Self {
            task_id: raw
                .task_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| task_id.to_string()),
            batch_id: raw.batch_id.filter(|id| !id.is_empty()),
            filename: raw.filename,
            status,
            stage,
            progress_percent: percent,
            current_step,
            completed_steps,
            total_steps,
            error_message,
            estimated_remaining_seconds,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Raise `progress_percent` to `floor` while the task is processing.
    /// `floor` is the highest percentage seen in earlier processing
    /// snapshots of the same task; step counts are recomputed when they were
    /// derived from the percentage.
    pub fn hold_progress(&mut self, floor: u8) {
        if self.status != TaskStatus::Processing || self.progress_percent >= floor {
            return;
        }
        self.progress_percent = floor.min(100);
        let derived = steps_for_percent(self.progress_percent, self.total_steps);
        self.completed_steps = self.completed_steps.max(derived).min(self.total_steps);
    }

    /// High-water mark after this snapshot: only processing snapshots move it.
    pub fn progress_floor(&self, floor: u8) -> u8 {
        if self.status == TaskStatus::Processing {
            floor.max(self.progress_percent)
        } else {
            floor
        }
    }
}

fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 100.0).floor() as u8
}

/// `floor(percent / 100 * total_steps)`.
pub fn steps_for_percent(percent: u8, total_steps: u32) -> u32 {
    (u32::from(percent.min(100)) * total_steps) / 100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Processing,
    Completed,
}

/// Aggregate of all tasks sharing a batch id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub total_files: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub queued_count: usize,
    pub processing_count: usize,
    pub batch_status: BatchStatus,
    /// Mean of the member percentages, terminal members counting as 100.
    pub overall_percent: u8,
}

impl BatchRecord {
    pub fn aggregate<'a>(
        batch_id: impl Into<String>,
        records: impl IntoIterator<Item = &'a ProgressRecord>,
    ) -> Self {
        let mut total_files = 0;
        let mut completed_count = 0;
        let mut failed_count = 0;
        let mut queued_count = 0;
        let mut processing_count = 0;
        let mut percent_sum: u64 = 0;

        for record in records {
            total_files += 1;
            match record.status {
                TaskStatus::Completed => completed_count += 1,
                TaskStatus::Failed => failed_count += 1,
                TaskStatus::Pending => queued_count += 1,
                TaskStatus::Processing => processing_count += 1,
            }
            percent_sum += if record.is_terminal() {
                100
            } else {
                u64::from(record.progress_percent)
            };
        }

        let batch_status = if queued_count == 0 && processing_count == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Processing
        };
        let overall_percent = if total_files == 0 {
            100
        } else {
            (percent_sum / total_files as u64) as u8
        };

        Self {
            batch_id: batch_id.into(),
            total_files,
            completed_count,
            failed_count,
            queued_count,
            processing_count,
            batch_status,
            overall_percent,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.batch_status == BatchStatus::Completed
    }
}

/// Group records by `batch_id`. Records without a batch are skipped.
pub fn group_by_batch(records: &[ProgressRecord]) -> Vec<BatchRecord> {
    let mut groups: BTreeMap<&str, Vec<&ProgressRecord>> = BTreeMap::new();
    for record in records {
        if let Some(batch_id) = record.batch_id.as_deref() {
            groups.entry(batch_id).or_default().push(record);
        }
    }
    groups
        .into_iter()
        .map(|(batch_id, members)| BatchRecord::aggregate(batch_id, members))
        .collect()
}
