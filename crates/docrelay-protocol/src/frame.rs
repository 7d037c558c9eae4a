//! Event frame codec.
//!
//! A frame is a named event followed by its payload and a blank line:
//!
//! ```text
//! event: result
//! data: {"documents":3}
//!
//! ```
//!
//! Multi-line payloads are written as one `data:` line per text line and
//! joined back with `\n` when decoded, so the `\n\n` delimiter never occurs
//! inside a frame on the wire. Decoding works on raw bytes: a chunk boundary
//! may fall anywhere, including inside a multi-byte UTF-8 sequence.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between two frames.
pub const DELIMITER: &[u8] = b"\n\n";

/// The closed set of events a relay session may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEvent {
    Started,
    Keepalive,
    Result,
    Error,
    Done,
}

impl StreamEvent {
    pub const ALL: [StreamEvent; 5] = [
        StreamEvent::Started,
        StreamEvent::Keepalive,
        StreamEvent::Result,
        StreamEvent::Error,
        StreamEvent::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamEvent::Started => "started",
            StreamEvent::Keepalive => "keepalive",
            StreamEvent::Result => "result",
            StreamEvent::Error => "error",
            StreamEvent::Done => "done",
        }
    }

    /// Whether this event closes a session. `result` is not terminal on its
    /// own: it is always followed by `done`.
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamEvent::Error | StreamEvent::Done)
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamEvent {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| FrameError::UnknownEvent(s.to_string()))
    }
}

/// Errors raised while building or parsing frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("frame carries data but no event name")]
    MissingEvent,

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("failed to serialize payload: {0}")]
    Serialize(String),
}

/// A single relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: StreamEvent,
    pub data: String,
}

impl Frame {
    pub fn new(event: StreamEvent, data: impl Into<String>) -> Self {
        Self {
            event,
            data: data.into(),
        }
    }

    /// Build a frame whose payload is the compact JSON form of `value`.
    pub fn json<T: Serialize + ?Sized>(event: StreamEvent, value: &T) -> Result<Self, FrameError> {
        let data =
            serde_json::to_string(value).map_err(|e| FrameError::Serialize(e.to_string()))?;
        Ok(Self { event, data })
    }

    pub fn is_terminal(&self) -> bool {
        self.event.is_terminal()
    }

    pub fn encode(&self) -> Bytes {
        encode(self.event, &self.data)
    }
}

/// Serialize an `(event, data)` pair into its wire form.
pub fn encode(event: StreamEvent, data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + 32);
    out.push_str("event: ");
    out.push_str(event.as_str());
    out.push('\n');
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

/// Serialize a structured payload compactly and frame it.
pub fn encode_json<T: Serialize + ?Sized>(
    event: StreamEvent,
    value: &T,
) -> Result<Bytes, FrameError> {
    Frame::json(event, value).map(|frame| frame.encode())
}

/// Split `buffer` into every complete frame it contains plus the trailing
/// incomplete segment.
///
/// The remainder must be prepended to the next chunk before decoding again.
/// Segments that only contain comments or blank lines produce no frame;
/// segments naming an unknown event are dropped with a warning.
pub fn decode(buffer: &[u8]) -> (Vec<Frame>, &[u8]) {
    let mut frames = Vec::new();
    let mut rest = buffer;

    while let Some(pos) = find_delimiter(rest) {
        let segment = &rest[..pos];
        rest = &rest[pos + DELIMITER.len()..];
        match parse_segment(segment) {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => {}
            Err(err) => log::warn!("dropping malformed frame: {}", err),
        }
    }

    (frames, rest)
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

fn parse_segment(segment: &[u8]) -> Result<Option<Frame>, FrameError> {
    let text = std::str::from_utf8(segment).map_err(|_| FrameError::InvalidUtf8)?;

    let mut event: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    match event {
        None if data_lines.is_empty() => Ok(None),
        None => Err(FrameError::MissingEvent),
        Some(name) => Ok(Some(Frame {
            event: name.parse()?,
            data: data_lines.join("\n"),
        })),
    }
}

/// Stateful wrapper around [`decode`] that owns the remainder between calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known not to contain a delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every frame completed by it.
    ///
    /// Only the new bytes (plus one byte of overlap for a delimiter split
    /// across chunks) are searched, so a large frame arriving in many small
    /// chunks is decoded in linear time.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let start = self.scanned.saturating_sub(DELIMITER.len() - 1);
        if find_delimiter(&self.buffer[start..]).is_none() {
            self.scanned = self.buffer.len();
            return Vec::new();
        }

        let (frames, remainder) = decode(&self.buffer);
        let consumed = self.buffer.len() - remainder.len();
        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();
        frames
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}
