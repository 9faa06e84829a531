//! Broker error types.

use std::time::Duration;
use thiserror::Error;

/// Broker error type.
///
/// Every variant means the broker cannot take messages right now; callers
/// keep the message and retry later.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Broker refused or dropped the connection
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Connection setup did not finish in time
    #[error("Broker connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No open channel to publish on
    #[error("Broker channel is closed")]
    ChannelClosed,
}

/// Result type alias using BrokerError.
pub type BrokerResult<T> = Result<T, BrokerError>;
