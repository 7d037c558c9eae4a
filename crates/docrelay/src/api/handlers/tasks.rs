//! Progress endpoints for the console.
//!
//! Each call forwards the caller's bearer credential to the progress service
//! and answers with normalized records.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use serde::Serialize;
use tracing::instrument;

use docrelay_protocol::{
    BatchRecord, ClearTaskResponse, NormalizedActiveTasks, NormalizedTaskProgress, group_by_batch,
};

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::tracker::ProgressClient;

#[derive(Debug, Serialize)]
pub struct ActiveBatchesResponse {
    pub success: bool,
    pub data: Vec<BatchRecord>,
}

/// Extract the token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn client_for(state: &AppState, headers: &HeaderMap) -> ProgressClient {
    state.progress.with_token(bearer_token(headers))
}

/// Progress of one task.
#[instrument(skip(state, headers))]
pub async fn task_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<NormalizedTaskProgress>> {
    let record = client_for(&state, &headers)
        .get_task_progress(&task_id)
        .await?;
    Ok(Json(NormalizedTaskProgress::new(record)))
}

/// All non-terminal tasks visible to the caller.
#[instrument(skip(state, headers))]
pub async fn active_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<NormalizedActiveTasks>> {
    let records = client_for(&state, &headers).list_active_tasks().await?;
    Ok(Json(NormalizedActiveTasks::new(records)))
}

/// Listed tasks aggregated per batch. Finished members stay in their batch.
#[instrument(skip(state, headers))]
pub async fn active_batches(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ActiveBatchesResponse>> {
    let records = client_for(&state, &headers).list_tasks().await?;
    Ok(Json(ActiveBatchesResponse {
        success: true,
        data: group_by_batch(&records),
    }))
}

/// Remove a task from the progress store. Unknown tasks succeed.
#[instrument(skip(state, headers))]
pub async fn clear_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<ClearTaskResponse>> {
    let response = client_for(&state, &headers).clear_task(&task_id).await?;
    Ok(Json(response))
}
