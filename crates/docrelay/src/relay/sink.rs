//! Single writer of a relay session.

use thiserror::Error;
use tokio::sync::mpsc;

use docrelay_protocol::Frame;

/// The response side went away; nothing written afterwards can be delivered.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("relay output is closed")]
pub struct SinkClosed;

/// Serialized output of one relay session.
///
/// The session and its heartbeat each hold a clone; every frame goes through
/// the same bounded channel so frames reach the client in send order. The
/// response body ends when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, frame: Frame) -> Result<(), SinkClosed> {
        self.tx.send(frame).await.map_err(|_| SinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
