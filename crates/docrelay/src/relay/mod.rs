//! Streaming relay.
//!
//! Turns one slow request/response call against the ingestion API into an
//! event stream the browser can show progress for:
//!
//! - `sink`: the single serialized writer of a session
//! - `heartbeat`: keepalive frames while the upstream call is outstanding
//! - `upstream`: the upstream call itself
//! - `session`: ordering of `started`, `keepalive`, `result`/`done`, `error`

mod heartbeat;
mod session;
mod sink;
mod upstream;

pub use heartbeat::Heartbeat;
pub use session::{RelaySession, SessionOutcome, SessionSummary};
pub use sink::{FrameSink, SinkClosed};
pub use upstream::{HttpUpstream, Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};
