//! docrelay: streaming relay and progress tracking for long-running
//! ingestion calls.
//!
//! - `relay`: one upstream call turned into an ordered event stream
//! - `consumer`: incremental client-side parsing of that stream
//! - `tracker`: polling of task and batch progress
//! - `api`: the HTTP surface serving both
//! - `config`: layered application configuration

pub mod api;
pub mod config;
pub mod consumer;
pub mod relay;
pub mod tracker;
