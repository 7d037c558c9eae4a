//! HTTP client for the relay endpoint.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use docrelay_protocol::UpstreamErrorBody;

use super::{
    ConsumerError, DEFAULT_MISSING_FIELDS_PREFIX, StreamConsumer, StreamHandler,
    consume_stream_with,
};

/// Posts requests through a running relay and consumes the event stream.
#[derive(Debug, Clone)]
pub struct RelayClient {
    client: Client,
    /// Base URL of the relay server (e.g., "http://localhost:8787").
    base_url: String,
    token: Option<String>,
    missing_fields_prefix: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, ConsumerError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConsumerError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            missing_fields_prefix: DEFAULT_MISSING_FIELDS_PREFIX.to_string(),
        })
    }

    /// Bearer credential forwarded to the upstream.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Prefix for validation errors, matching the relay's `relay.missing_fields_prefix`.
    pub fn with_missing_fields_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.missing_fields_prefix = prefix.into();
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/api/relay/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST `body` to the relay and dispatch its frames to `handler`.
    pub async fn post<H>(
        &self,
        path: &str,
        content_type: &str,
        body: impl Into<Bytes>,
        handler: &mut H,
    ) -> Result<Value, ConsumerError>
    where
        H: StreamHandler + ?Sized,
    {
        let url = self.endpoint(path);
        log::debug!("Posting to relay at {}", url);

        let mut request = self
            .client
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CONTENT_TYPE, content_type)
            .body(body.into());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            let err = ConsumerError::Transport(format!("Failed to connect to relay at {url}: {e}"));
            handler.on_error(&err, &err.notice());
            err
        })?;

        consume_response(response, &self.missing_fields_prefix, handler).await
    }
}

/// Consume a relay response.
///
/// The relay always answers 200; any other status means the request never
/// reached a session and is reported as an upstream failure.
pub async fn consume_response<H>(
    response: reqwest::Response,
    missing_fields_prefix: &str,
    handler: &mut H,
) -> Result<Value, ConsumerError>
where
    H: StreamHandler + ?Sized,
{
    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        let parsed = UpstreamErrorBody::parse(&body);
        let message = if parsed.is_empty() {
            format!("Relay returned HTTP {}", status.as_u16())
        } else {
            parsed.describe(missing_fields_prefix)
        };
        let err = ConsumerError::Upstream(message);
        handler.on_error(&err, &err.notice());
        return Err(err);
    }

    let consumer = StreamConsumer::new().with_missing_fields_prefix(missing_fields_prefix);
    consume_stream_with(consumer, response.bytes_stream(), handler).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_relay_prefix() {
        let client = RelayClient::new("http://localhost:8787/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.endpoint("/documents/bulk"),
            "http://localhost:8787/api/relay/documents/bulk"
        );
    }

    #[test]
    fn empty_token_is_ignored() {
        let client = RelayClient::new("http://localhost:8787", Duration::from_secs(1))
            .unwrap()
            .with_token(Some(String::new()));
        assert!(client.token.is_none());
    }
}
