//! Upstream calls made by relay sessions.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;

use docrelay_protocol::UpstreamErrorBody;

use crate::config::UpstreamConfig;

/// The inbound request, forwarded unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequest {
    /// Path below the upstream base URL, without a leading slash.
    pub path: String,
    pub query: Option<String>,
    /// Raw `Authorization` header value of the caller.
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Status and full body of a completed upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Most specific human readable message of an error response.
    pub fn error_message(&self, missing_fields_prefix: &str) -> String {
        let parsed = UpstreamErrorBody::parse(&self.body);
        if parsed.is_empty() {
            format!("Upstream returned HTTP {}", self.status)
        } else {
            parsed.describe(missing_fields_prefix)
        }
    }
}

/// The call failed before any response was received.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Failed to connect to upstream at {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Upstream request to {url} timed out")]
    Timeout { url: String },

    #[error("Upstream response from {url} is not valid UTF-8")]
    InvalidBody { url: String },

    #[error("Upstream request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
}

/// A long-running backend operation.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// Forwards relay requests over HTTP.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut builder = Client::builder().connect_timeout(config.connect_timeout());
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.target_url(&request.path, request.query.as_deref());
        log::debug!("Relaying request to {}", url);

        let mut builder = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .body(request.body);
        if let Some(authorization) = request.authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }

        let response = builder.send().await.map_err(|err| classify(&url, err))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|err| classify(&url, err))?;
        decode_body(&url, status, bytes)
    }
}

/// Successful bodies are relayed verbatim, so they must be valid UTF-8.
/// Error bodies only feed the error message and are decoded lossily.
fn decode_body(url: &str, status: u16, bytes: Bytes) -> Result<UpstreamResponse, UpstreamError> {
    let response = match String::from_utf8(bytes.to_vec()) {
        Ok(body) => UpstreamResponse { status, body },
        Err(err) => {
            let response = UpstreamResponse {
                status,
                body: String::from_utf8_lossy(err.as_bytes()).into_owned(),
            };
            if response.is_success() {
                return Err(UpstreamError::InvalidBody {
                    url: url.to_string(),
                });
            }
            response
        }
    };
    Ok(response)
}

fn classify(url: &str, err: reqwest::Error) -> UpstreamError {
    if err.is_connect() {
        UpstreamError::ConnectionFailed {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else if err.is_timeout() {
        UpstreamError::Timeout {
            url: url.to_string(),
        }
    } else {
        UpstreamError::RequestFailed(err)
    }
}
