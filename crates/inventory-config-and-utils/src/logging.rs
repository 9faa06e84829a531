//! Logging initialization.
//!
//! Wraps the observability crate: JSONL to the service log file, compact
//! output on stderr, `RUST_LOG` taking precedence over the configured level.

use std::path::Path;
use tracing::Level;

/// Service name written into every log line.
pub const SERVICE_NAME: &str = "inventory-outbox";

/// Install the global subscriber for the outbox service.
///
/// ```ignore
/// init_logging(&config.log_level, &paths.log_file())?;
/// ```
pub fn init_logging(level: &str, log_file: &Path) -> std::io::Result<()> {
    let default_level = parse_level(level).to_string().to_ascii_lowercase();
    observability::init_with_config(observability::LogConfig {
        service_name: SERVICE_NAME.into(),
        default_level,
        log_path: Some(log_file.to_path_buf()),
        also_stderr: true,
    })
    .map(|_| ())
}

/// Map a configured level name onto a tracing level.
///
/// Accepts anything `Level` parses plus the `warning` alias; everything else
/// falls back to INFO.
pub fn parse_level(level: &str) -> Level {
    let level = level.trim();
    if level.eq_ignore_ascii_case("warning") {
        return Level::WARN;
    }
    level.parse().unwrap_or(Level::INFO)
}
