//! Keepalive frames for idle relay sessions.
//!
//! Proxies and load balancers drop connections that stay silent for too
//! long. While the upstream call is outstanding a [`Heartbeat`] writes a
//! `keepalive` frame every interval.

use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use docrelay_protocol::{Frame, StreamEvent};

use super::sink::FrameSink;

/// Running heartbeat of one session.
///
/// [`Heartbeat::stop`] ends it and waits for the timer task, so no keepalive
/// can be written after `stop` returns. Dropping the guard without calling
/// `stop` still cancels the timer.
#[derive(Debug)]
pub struct Heartbeat {
    cancel: CancellationToken,
    handle: Option<JoinHandle<usize>>,
}

impl Heartbeat {
    /// Start writing keepalives to `sink`. The first one is sent after a
    /// full `interval`.
    ///
    /// A failed write means the client is gone: the heartbeat cancels
    /// `session` and exits instead of reporting an error.
    pub fn start(
        sink: FrameSink,
        interval: Duration,
        message: impl Into<String>,
        session: CancellationToken,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(beat(sink, interval, message.into(), cancel.clone(), session));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the heartbeat and return how many keepalives were written.
    pub async fn stop(mut self) -> usize {
        self.cancel.cancel();
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(sent) => sent,
                Err(err) => {
                    warn!("heartbeat task ended abnormally: {}", err);
                    0
                }
            },
            None => 0,
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            handle.abort();
        }
    }
}

async fn beat(
    sink: FrameSink,
    interval: Duration,
    message: String,
    cancel: CancellationToken,
    session: CancellationToken,
) -> usize {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if sink.send(Frame::new(StreamEvent::Keepalive, message.as_str())).await.is_err() {
                    debug!("keepalive write failed, client disconnected");
                    session.cancel();
                    break;
                }
                sent += 1;
            }
        }
    }

    sent
}
