//! Configuration, paths and logging setup for the inventory outbox.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, DEFAULT_BROKER_URL, DEFAULT_LOG_LEVEL, DEFAULT_QUEUE_NAME};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, SERVICE_NAME};
pub use paths::Paths;
