//! Client side of the relay stream.
//!
//! [`StreamConsumer`] turns response chunks of any size into events, one
//! chunk at a time. [`consume_stream`] drives it over a byte stream and calls
//! a [`StreamHandler`] per event.

mod client;
pub mod notice;

use std::fmt::Display;

use futures::{Stream, StreamExt};
use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use docrelay_protocol::{Frame, FrameDecoder, StreamEvent, UpstreamErrorBody};

pub use client::{RelayClient, consume_response};
pub use notice::{Notice, NoticeLevel};

pub(crate) const DEFAULT_MISSING_FIELDS_PREFIX: &str = "Missing fields";

/// Why a relay stream did not produce a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumerError {
    /// The server sent an `error` frame.
    #[error("{0}")]
    Upstream(String),

    /// The `result` payload could not be parsed.
    #[error("Could not process the server response")]
    UnreadableResult { reason: String },

    /// The stream ended without `result` or `error`.
    #[error("Expected result was not received")]
    MissingResult,

    /// The connection failed while reading the stream.
    #[error("Stream interrupted: {0}")]
    Transport(String),
}

impl ConsumerError {
    /// Every consumer error is a definitive failure of the action.
    pub fn notice(&self) -> Notice {
        Notice::failure(self.to_string())
    }
}

/// A dispatched frame, as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Started(String),
    Result(Value),
    Failed(ConsumerError),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingResult,
    ResultReceived,
    Closed,
}

/// Incremental parser of one relay stream.
#[derive(Debug)]
pub struct StreamConsumer {
    decoder: FrameDecoder,
    phase: Phase,
    missing_fields_prefix: String,
}

impl Default for StreamConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            phase: Phase::AwaitingResult,
            missing_fields_prefix: DEFAULT_MISSING_FIELDS_PREFIX.to_string(),
        }
    }

    pub fn with_missing_fields_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.missing_fields_prefix = prefix.into();
        self
    }

    /// Whether a terminal frame was seen. Later input is ignored.
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn has_result(&self) -> bool {
        self.phase == Phase::ResultReceived
    }

    /// Feed one chunk and return the events it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ConsumerEvent> {
        if self.is_closed() {
            return Vec::new();
        }

        let mut events = Vec::new();
        for frame in self.decoder.push(chunk) {
            if self.is_closed() {
                debug!("ignoring {} frame after terminal frame", frame.event);
                continue;
            }
            if let Some(event) = self.dispatch(frame) {
                events.push(event);
            }
        }
        if self.is_closed() {
            self.decoder.clear();
        }
        events
    }

    /// Signal end of input. Yields the implicit failure when neither a
    /// result nor an error arrived.
    pub fn finish(&mut self) -> Option<ConsumerEvent> {
        let phase = std::mem::replace(&mut self.phase, Phase::Closed);
        self.decoder.clear();
        match phase {
            Phase::AwaitingResult => Some(ConsumerEvent::Failed(ConsumerError::MissingResult)),
            Phase::ResultReceived => {
                warn!("relay stream ended without a done frame");
                None
            }
            Phase::Closed => None,
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Option<ConsumerEvent> {
        match frame.event {
            StreamEvent::Started => Some(ConsumerEvent::Started(frame.data)),
            StreamEvent::Keepalive => None,
            StreamEvent::Result => {
                if self.phase == Phase::ResultReceived {
                    warn!("ignoring duplicate result frame");
                    return None;
                }
                match serde_json::from_str::<Value>(&frame.data) {
                    Ok(value) => {
                        self.phase = Phase::ResultReceived;
                        Some(ConsumerEvent::Result(value))
                    }
                    Err(err) => {
                        warn!("unreadable result payload: {}", err);
                        self.phase = Phase::Closed;
                        Some(ConsumerEvent::Failed(ConsumerError::UnreadableResult {
                            reason: err.to_string(),
                        }))
                    }
                }
            }
            StreamEvent::Error => {
                self.phase = Phase::Closed;
                let message = self.error_text(&frame.data);
                Some(ConsumerEvent::Failed(ConsumerError::Upstream(message)))
            }
            StreamEvent::Done => {
                let previous = std::mem::replace(&mut self.phase, Phase::Closed);
                if previous == Phase::ResultReceived {
                    Some(ConsumerEvent::Done)
                } else {
                    Some(ConsumerEvent::Failed(ConsumerError::MissingResult))
                }
            }
        }
    }

    fn error_text(&self, data: &str) -> String {
        let structured = serde_json::from_str::<Value>(data)
            .ok()
            .and_then(|value| UpstreamErrorBody::from_value(&value));
        match structured {
            Some(body) => body.describe(&self.missing_fields_prefix),
            None => data.to_string(),
        }
    }
}

/// Per-event hooks. Only `on_result` and `on_error` are required.
pub trait StreamHandler {
    fn on_started(&mut self, _message: &str) {}

    fn on_result(&mut self, result: &Value);

    fn on_error(&mut self, error: &ConsumerError, notice: &Notice);

    fn on_done(&mut self) {}
}

/// Read `stream` to its end or its terminal frame, dispatching to `handler`.
///
/// Returns the parsed result, or the error that ended the stream. The stream
/// is not read past a terminal frame.
pub async fn consume_stream<S, B, E, H>(stream: S, handler: &mut H) -> Result<Value, ConsumerError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    H: StreamHandler + ?Sized,
{
    consume_stream_with(StreamConsumer::new(), stream, handler).await
}

/// [`consume_stream`] with a preconfigured consumer.
pub async fn consume_stream_with<S, B, E, H>(
    mut consumer: StreamConsumer,
    stream: S,
    handler: &mut H,
) -> Result<Value, ConsumerError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    H: StreamHandler + ?Sized,
{
    let mut stream = std::pin::pin!(stream);
    let mut result: Option<Value> = None;
    let mut failure: Option<ConsumerError> = None;

    while let Some(chunk) = stream.next().await {
        let events = match chunk {
            Ok(bytes) => consumer.push(bytes.as_ref()),
            Err(err) if consumer.has_result() => {
                warn!("relay stream failed after its result: {}", err);
                break;
            }
            Err(err) => {
                consumer.finish();
                vec![ConsumerEvent::Failed(ConsumerError::Transport(err.to_string()))]
            }
        };
        for event in events {
            deliver(event, handler, &mut result, &mut failure);
        }
        if consumer.is_closed() {
            break;
        }
    }

    if let Some(event) = consumer.finish() {
        deliver(event, handler, &mut result, &mut failure);
    }

    match (failure, result) {
        (Some(err), _) => Err(err),
        (None, Some(value)) => Ok(value),
        (None, None) => Err(ConsumerError::MissingResult),
    }
}

fn deliver<H: StreamHandler + ?Sized>(
    event: ConsumerEvent,
    handler: &mut H,
    result: &mut Option<Value>,
    failure: &mut Option<ConsumerError>,
) {
    match event {
        ConsumerEvent::Started(message) => handler.on_started(&message),
        ConsumerEvent::Result(value) => {
            handler.on_result(&value);
            *result = Some(value);
        }
        ConsumerEvent::Failed(err) => {
            handler.on_error(&err, &err.notice());
            failure.get_or_insert(err);
        }
        ConsumerEvent::Done => handler.on_done(),
    }
}
