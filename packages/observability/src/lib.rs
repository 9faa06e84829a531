//! # Observability
//!
//! Structured logging for the inventory outbox services.
//!
//! Services call [`init`] or [`init_with_config`] once at startup and then use
//! the plain `tracing` macros. Every event is written as one JSON object per
//! line to an append-only file (by default
//! `~/.inventory-outbox/logs/outbox.jsonl`), which can be followed with
//! `tail -f ... | jq`. A compact human-readable stderr layer is optional.
//!
//! `RUST_LOG` overrides the configured default level.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "inventory-outbox".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! })?;
//! tracing::info!("service started");
//! ```

mod json_layer;
mod writer;

pub use json_layer::JsonLayer;
pub use writer::AppendWriter;

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Written into every log line as `service`.
    pub service_name: String,

    /// Default filter, e.g. "info" or "inventory_outbox=debug".
    pub default_level: String,

    /// JSONL file path. Defaults to `~/.inventory-outbox/logs/outbox.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Also emit compact logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

fn default_log_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".inventory-outbox")
        .join("logs")
        .join("outbox.jsonl")
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with default settings for `service_name`.
pub fn init(service_name: &str) -> io::Result<PathBuf> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Install the global subscriber. Returns the JSONL file path in use.
///
/// Fails if the log file cannot be opened or a global subscriber is already
/// installed.
pub fn init_with_config(config: LogConfig) -> io::Result<PathBuf> {
    let log_path = config.log_path.clone().unwrap_or_else(default_log_path);
    let writer = AppendWriter::open(&log_path)?;

    let json_layer =
        JsonLayer::new(config.service_name.clone(), writer).with_filter(env_filter(&config.default_level));

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;

    tracing::info!(
        service = %config.service_name,
        log_path = %log_path.display(),
        "observability initialized"
    );
    Ok(log_path)
}
