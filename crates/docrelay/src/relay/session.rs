//! One relay session: a single upstream call translated into frames.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docrelay_protocol::{Frame, StreamEvent};

use super::heartbeat::Heartbeat;
use super::sink::FrameSink;
use super::upstream::{Upstream, UpstreamRequest};
use crate::config::RelayConfig;

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// `result` and `done` were written.
    Completed,
    /// The upstream answered with a non-success status; `error` was written.
    UpstreamError { status: u16 },
    /// The upstream could not be reached; `error` was written.
    TransportError,
    /// The client disconnected before a terminal frame could be written.
    ClientGone,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub outcome: SessionOutcome,
    pub keepalives: usize,
    pub elapsed: Duration,
}

/// Translates one upstream call into `started`, any number of `keepalive`,
/// then either `result` + `done` or a single `error`.
///
/// Nothing is retried. The session writes through `sink` only and drops it
/// when it returns, which ends the response stream.
pub struct RelaySession {
    id: Uuid,
    upstream: Arc<dyn Upstream>,
    config: Arc<RelayConfig>,
}

impl RelaySession {
    pub fn new(upstream: Arc<dyn Upstream>, config: Arc<RelayConfig>) -> Self {
        Self {
            id: Uuid::new_v4(),
            upstream,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn run(self, request: UpstreamRequest, sink: FrameSink) -> SessionSummary {
        let started_at = Instant::now();
        debug!("relay session {} started for /{}", self.id, request.path);

        let summary = |outcome, keepalives| SessionSummary {
            session_id: self.id,
            outcome,
            keepalives,
            elapsed: started_at.elapsed(),
        };

        let started = Frame::new(StreamEvent::Started, self.config.started_message.as_str());
        if sink.send(started).await.is_err() {
            return summary(SessionOutcome::ClientGone, 0);
        }

        let cancel = CancellationToken::new();
        let heartbeat = Heartbeat::start(
            sink.clone(),
            self.config.heartbeat_interval(),
            self.config.keepalive_message.as_str(),
            cancel.clone(),
        );

        let call = tokio::select! {
            result = self.upstream.call(request) => Some(result),
            _ = cancel.cancelled() => None,
        };
        let keepalives = heartbeat.stop().await;

        let outcome = match call {
            None => {
                info!("relay session {}: client disconnected, upstream call abandoned", self.id);
                SessionOutcome::ClientGone
            }
            Some(Ok(response)) if response.is_success() => {
                let delivered = sink
                    .send(Frame::new(StreamEvent::Result, response.body))
                    .await
                    .is_ok()
                    && sink
                        .send(Frame::new(StreamEvent::Done, self.config.done_message.as_str()))
                        .await
                        .is_ok();
                if delivered {
                    SessionOutcome::Completed
                } else {
                    SessionOutcome::ClientGone
                }
            }
            Some(Ok(response)) => {
                let message = response.error_message(&self.config.missing_fields_prefix);
                warn!(
                    "relay session {}: upstream returned {}: {}",
                    self.id, response.status, message
                );
                match sink.send(Frame::new(StreamEvent::Error, message)).await {
                    Ok(()) => SessionOutcome::UpstreamError {
                        status: response.status,
                    },
                    Err(_) => SessionOutcome::ClientGone,
                }
            }
            Some(Err(err)) => {
                warn!("relay session {}: {}", self.id, err);
                let frame = Frame::new(
                    StreamEvent::Error,
                    self.config.transport_error_message.as_str(),
                );
                match sink.send(frame).await {
                    Ok(()) => SessionOutcome::TransportError,
                    Err(_) => SessionOutcome::ClientGone,
                }
            }
        };

        drop(sink);
        summary(outcome, keepalives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::upstream::{UpstreamError, UpstreamResponse};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Upstream that answers after a fixed delay.
    struct Delayed {
        delay: Duration,
        response: Option<UpstreamResponse>,
    }

    #[async_trait]
    impl Upstream for Delayed {
        async fn call(
            &self,
            _request: UpstreamRequest,
        ) -> Result<UpstreamResponse, UpstreamError> {
            tokio::time::sleep(self.delay).await;
            match &self.response {
                Some(response) => Ok(response.clone()),
                None => Err(UpstreamError::ConnectionFailed {
                    url: "http://ingest.invalid/scan".into(),
                    message: "connection refused".into(),
                }),
            }
        }
    }

    fn session(delay_secs: u64, response: Option<UpstreamResponse>) -> RelaySession {
        RelaySession::new(
            Arc::new(Delayed {
                delay: Duration::from_secs(delay_secs),
                response,
            }),
            Arc::new(RelayConfig::default()),
        )
    }

    async fn drain(mut rx: mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    fn events(frames: &[Frame]) -> Vec<StreamEvent> {
        frames.iter().map(|f| f.event).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn slow_success_interleaves_two_keepalives() {
        let (sink, rx) = FrameSink::channel(16);
        let body = r#"{"ingested":12}"#;
        let summary = session(45, Some(UpstreamResponse::new(200, body)))
            .run(UpstreamRequest::default(), sink)
            .await;

        let frames = drain(rx).await;
        assert_eq!(
            events(&frames),
            vec![
                StreamEvent::Started,
                StreamEvent::Keepalive,
                StreamEvent::Keepalive,
                StreamEvent::Result,
                StreamEvent::Done,
            ]
        );
        assert_eq!(frames[3].data, body);
        assert_eq!(summary.outcome, SessionOutcome::Completed);
        assert_eq!(summary.keepalives, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_error_ends_with_single_error_frame() {
        let (sink, rx) = FrameSink::channel(16);
        let body = r#"{"detail":[{"loc":["body","file"],"msg":"required"}]}"#;
        let summary = session(1, Some(UpstreamResponse::new(422, body)))
            .run(UpstreamRequest::default(), sink)
            .await;

        let frames = drain(rx).await;
        assert_eq!(events(&frames), vec![StreamEvent::Started, StreamEvent::Error]);
        assert_eq!(frames[1].data, "Missing fields: body.file");
        assert_eq!(summary.outcome, SessionOutcome::UpstreamError { status: 422 });
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_uses_fallback_message() {
        let (sink, rx) = FrameSink::channel(16);
        let summary = session(0, None).run(UpstreamRequest::default(), sink).await;

        let frames = drain(rx).await;
        assert_eq!(events(&frames), vec![StreamEvent::Started, StreamEvent::Error]);
        assert_eq!(frames[1].data, RelayConfig::default().transport_error_message);
        assert_eq!(summary.outcome, SessionOutcome::TransportError);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_one_terminal_frame_in_every_branch() {
        let cases = [
            Some(UpstreamResponse::new(200, "{}")),
            Some(UpstreamResponse::new(500, "boom")),
            None,
        ];
        for response in cases {
            let (sink, rx) = FrameSink::channel(16);
            session(61, response).run(UpstreamRequest::default(), sink).await;
            let frames = drain(rx).await;

            let terminals: Vec<usize> = frames
                .iter()
                .enumerate()
                .filter(|(_, f)| f.is_terminal())
                .map(|(i, _)| i)
                .collect();
            assert_eq!(terminals, vec![frames.len() - 1]);
            assert_eq!(frames[0].event, StreamEvent::Started);
            assert_eq!(
                frames.iter().filter(|f| f.event == StreamEvent::Started).count(),
                1
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_count_tracks_upstream_duration() {
        for (secs, interval) in [(5u64, 20u64), (19, 20), (45, 20), (100, 20), (30, 7)] {
            let (sink, rx) = FrameSink::channel(64);
            let config = RelayConfig {
                heartbeat_interval_secs: interval,
                ..Default::default()
            };
            let summary = RelaySession::new(
                Arc::new(Delayed {
                    delay: Duration::from_secs(secs),
                    response: Some(UpstreamResponse::new(200, "{}")),
                }),
                Arc::new(config),
            )
            .run(UpstreamRequest::default(), sink)
            .await;

            let keepalives = drain(rx)
                .await
                .iter()
                .filter(|f| f.event == StreamEvent::Keepalive)
                .count();
            let expected = (secs / interval) as usize;
            assert!(
                keepalives.abs_diff(expected) <= 1,
                "{secs}s at {interval}s interval: {keepalives} keepalives"
            );
            assert_eq!(keepalives, summary.keepalives);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_abandons_the_upstream_call() {
        let (sink, rx) = FrameSink::channel(16);
        let run = tokio::spawn(
            session(3600, Some(UpstreamResponse::new(200, "{}")))
                .run(UpstreamRequest::default(), sink),
        );
        tokio::task::yield_now().await;
        drop(rx);

        let summary = tokio::time::timeout(Duration::from_secs(60), run)
            .await
            .expect("session should end after the next keepalive fails")
            .unwrap();
        assert_eq!(summary.outcome, SessionOutcome::ClientGone);
    }
}
