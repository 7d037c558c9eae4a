//! HTTP client for the progress endpoints.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use docrelay_protocol::{
    ActiveTasksResponse, ClearTaskResponse, ProgressRecord, TaskProgressResponse,
    UpstreamErrorBody,
};

use super::error::{TrackerError, TrackerResult};
use crate::config::TrackerConfig;
use crate::consumer::DEFAULT_MISSING_FIELDS_PREFIX;

/// Client for the pipeline's progress API.
#[derive(Debug, Clone)]
pub struct ProgressClient {
    client: Client,
    /// Base URL of the progress endpoints (e.g., "http://localhost:8000").
    base_url: String,
    /// Bearer credential sent with every call.
    token: Option<String>,
    default_total_steps: u32,
    missing_fields_prefix: String,
}

impl ProgressClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        config: &TrackerConfig,
    ) -> TrackerResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            default_total_steps: config.default_total_steps,
            missing_fields_prefix: DEFAULT_MISSING_FIELDS_PREFIX.to_string(),
        })
    }

    /// Same client, different credential. The connection pool is shared.
    pub fn with_token(&self, token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            ..self.clone()
        }
    }

    /// Prefix used when an error body lists invalid fields.
    pub fn with_missing_fields_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.missing_fields_prefix = prefix.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, url: &str) -> TrackerResult<reqwest::Response> {
        self.authorize(builder).send().await.map_err(|e| {
            if e.is_connect() {
                TrackerError::ConnectionFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            } else {
                TrackerError::RequestFailed(e)
            }
        })
    }

    /// Fetch and normalize the progress of one task.
    pub async fn get_task_progress(&self, task_id: &str) -> TrackerResult<ProgressRecord> {
        let url = self.url(&format!(
            "tasks/{}/progress",
            urlencoding::encode(task_id)
        ));
        let response = self.send(self.client.get(&url), &url).await?;
        let body: TaskProgressResponse = self.handle_response(response, task_id).await?;

        Ok(ProgressRecord::normalize(
            task_id,
            body.progress,
            self.default_total_steps,
        ))
    }

    /// Every task record the progress store lists for the caller, terminal
    /// ones included. Batch aggregates are built from this list so finished
    /// members stay counted.
    pub async fn list_tasks(&self) -> TrackerResult<Vec<ProgressRecord>> {
        let url = self.url("tasks/active");
        let response = self.send(self.client.get(&url), &url).await?;
        let body: ActiveTasksResponse = self.handle_response(response, "active").await?;

        Ok(body
            .data
            .active_tasks
            .into_iter()
            .map(|raw| {
                let task_id = raw.task_id.clone().unwrap_or_default();
                ProgressRecord::normalize(&task_id, raw, self.default_total_steps)
            })
            .collect())
    }

    /// All tasks the caller can see that have not reached a terminal state.
    pub async fn list_active_tasks(&self) -> TrackerResult<Vec<ProgressRecord>> {
        let mut records = self.list_tasks().await?;
        records.retain(|record| !record.is_terminal());
        Ok(records)
    }

    /// Remove a task from the progress store. Clearing an unknown task
    /// succeeds.
    pub async fn clear_task(&self, task_id: &str) -> TrackerResult<ClearTaskResponse> {
        let url = self.url(&format!("tasks/{}", urlencoding::encode(task_id)));
        let response = self.send(self.client.delete(&url), &url).await?;

        if response.status() == StatusCode::NOT_FOUND {
            log::debug!("task {} already cleared", task_id);
            return Ok(ClearTaskResponse {
                success: true,
                message: format!("Task {} is not tracked", task_id),
            });
        }
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(ClearTaskResponse {
                success: true,
                message: format!("Task {} cleared", task_id),
            });
        }
        self.handle_response(response, task_id).await
    }

    /// Handle response and parse JSON or error.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        subject: &str,
    ) -> TrackerResult<T> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| TrackerError::ParseError(format!("Failed to parse response: {}", e)));
        }

        match status {
            StatusCode::UNAUTHORIZED => Err(TrackerError::Unauthorized),
            StatusCode::NOT_FOUND => Err(TrackerError::NotFound(subject.to_string())),
            _ => {
                let text = response.text().await.unwrap_or_default();
                let parsed = UpstreamErrorBody::parse(&text);
                let message = if parsed.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("unknown error")
                        .to_string()
                } else {
                    parsed.describe(&self.missing_fields_prefix)
                };
                Err(TrackerError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}
