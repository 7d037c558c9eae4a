//! Wire types shared by the docrelay server, its stream consumer and the
//! progress tracker.
//!
//! Nothing in this crate performs I/O:
//! - `frame`: the `event:`/`data:` frame codec used by the relay stream
//! - `upstream`: the loosely typed error bodies returned by the pipeline API
//! - `progress`: progress and batch records plus their normalization rules
//! - `api`: JSON envelopes of the progress endpoints

pub mod api;
pub mod frame;
pub mod progress;
pub mod upstream;

pub use api::{
    ActiveTasks, ActiveTasksResponse, ClearTaskResponse, NormalizedActiveTasks,
    NormalizedTaskProgress, TaskProgressResponse,
};
pub use frame::{Frame, FrameDecoder, FrameError, StreamEvent, decode, encode, encode_json};
pub use progress::{
    BatchRecord, BatchStatus, DEFAULT_TOTAL_STEPS, PipelineStage, ProgressRecord, RawProgress,
    TaskStatus, group_by_batch, steps_for_percent,
};
pub use upstream::{FieldError, UpstreamErrorBody};
