//! Application configuration.
//!
//! Loaded by the binary from defaults, a TOML file and `DOCRELAY__*`
//! environment variables, in that order.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use docrelay_protocol::DEFAULT_TOTAL_STEPS;

pub const APP_NAME: &str = "docrelay";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: String,
    pub logging: LoggingConfig,
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Ingestion API the relay forwards to.
    pub upstream: UpstreamConfig,
    /// Streaming relay behaviour.
    pub relay: RelayConfig,
    /// Progress polling.
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in megabytes (default: 100).
    pub max_body_size_mb: usize,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_body_size_mb: 100,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    /// Overall limit for one upstream call. Unset means the relay waits as
    /// long as the upstream keeps the request open.
    pub request_timeout_secs: Option<u64>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: None,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub heartbeat_interval_secs: u64,
    /// Frames buffered between the session and the response body.
    pub channel_capacity: usize,
    /// Payload of the `started` frame.
    pub started_message: String,
    /// Payload of `keepalive` frames.
    pub keepalive_message: String,
    /// Payload of the `done` frame.
    pub done_message: String,
    /// Sent when the upstream could not be reached at all.
    pub transport_error_message: String,
    /// Prefix for validation errors, e.g. `Missing fields: body.file`.
    pub missing_fields_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 20,
            channel_capacity: 16,
            started_message: "processing".to_string(),
            keepalive_message: "ping".to_string(),
            done_message: "complete".to_string(),
            transport_error_message: "Could not reach the ingestion service. Please try again."
                .to_string(),
            missing_fields_prefix: "Missing fields".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Base URL of the progress endpoints. Defaults to the upstream base URL.
    pub base_url: Option<String>,
    pub poll_interval_ms: u64,
    pub default_total_steps: u32,
    /// Consecutive failed polls before a stall is reported.
    pub stall_after_failures: u32,
    pub request_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_ms: 2_000,
            default_total_steps: DEFAULT_TOTAL_STEPS,
            stall_after_failures: 3,
            request_timeout_secs: 30,
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resolved_base_url<'a>(&'a self, upstream: &'a UpstreamConfig) -> &'a str {
        self.base_url.as_deref().unwrap_or(&upstream.base_url)
    }
}

/// `DOCRELAY`: prefix of environment overrides such as
/// `DOCRELAY__RELAY__HEARTBEAT_INTERVAL_SECS`.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Load defaults, then `path` (if it exists), then the process environment.
pub fn load(path: &Path) -> Result<AppConfig> {
    load_with_env(path, environment())
}

fn environment() -> Environment {
    Environment::with_prefix(env_prefix().as_str())
        .separator("__")
        .try_parsing(true)
}

fn load_with_env(path: &Path, environment: Environment) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("profile", "default")?
        .set_default("logging.level", "info")?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(environment)
        .build()
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    built
        .try_deserialize()
        .with_context(|| format!("parsing configuration from {}", path.display()))
}

/// Write the default configuration with a short header.
pub fn write_default(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Environment overrides: ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__<SECTION>__<KEY>\n");
    buffer.push('\n');
    buffer
}
