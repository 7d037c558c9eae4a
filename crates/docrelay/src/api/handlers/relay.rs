//! Streaming relay endpoint.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument, warn};

use crate::api::state::AppState;
use crate::relay::{FrameSink, RelaySession, SessionOutcome, UpstreamRequest};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Relay one request to the upstream and stream its progress back.
///
/// Always answers 200 with an event stream; the outcome travels in the
/// frames. The session runs on its own task and ends early when the client
/// goes away.
#[instrument(skip(state, headers, body), fields(body_len = body.len()))]
pub async fn relay(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = UpstreamRequest {
        path,
        query,
        authorization: header_value(&headers, header::AUTHORIZATION),
        content_type: header_value(&headers, header::CONTENT_TYPE),
        body,
    };

    let (sink, rx) = FrameSink::channel(state.relay.channel_capacity);
    let session = RelaySession::new(state.upstream.clone(), state.relay.clone());
    let path = request.path.clone();

    tokio::spawn(async move {
        let summary = session.run(request, sink).await;
        let elapsed_ms = summary.elapsed.as_millis() as u64;
        match summary.outcome {
            SessionOutcome::Completed | SessionOutcome::UpstreamError { .. } => info!(
                session_id = %summary.session_id,
                path = %path,
                outcome = ?summary.outcome,
                keepalives = summary.keepalives,
                elapsed_ms,
                "Relay session finished"
            ),
            SessionOutcome::TransportError | SessionOutcome::ClientGone => warn!(
                session_id = %summary.session_id,
                path = %path,
                outcome = ?summary.outcome,
                keepalives = summary.keepalives,
                elapsed_ms,
                "Relay session ended abnormally"
            ),
        }
    });

    let frames = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.encode()));
    build_event_stream_response(Body::from_stream(frames))
}

fn build_event_stream_response(body: Body) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            // Disable nginx buffering if present
            (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
        ],
        body,
    )
        .into_response()
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
