//! Outbox error types.

use inventory_broker::BrokerError;
use inventory_database::DatabaseError;
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Sequence number already stored
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Row is not in the state the transition requires
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Broker connection or publish failed; retried by the dispatcher
    #[error(transparent)]
    BrokerUnavailable(#[from] BrokerError),

    /// SQLite or executor failure
    #[error("Storage error: {0}")]
    Storage(DatabaseError),

    /// Domain entity missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<DatabaseError> for OutboxError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Conflict(msg) => Self::Conflict(msg),
            DatabaseError::NotFound(msg) => Self::NotFound(msg),
            e @ DatabaseError::InvalidState { .. } => Self::InvalidState(e.to_string()),
            other => Self::Storage(other),
        }
    }
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_database::OutboxState;

    #[test]
    fn database_errors_map_to_outbox_taxonomy() {
        let conflict: OutboxError = DatabaseError::Conflict("sequence number 3 already used".into()).into();
        assert!(matches!(conflict, OutboxError::Conflict(_)));

        let invalid: OutboxError = DatabaseError::InvalidState {
            id: 1,
            expected: OutboxState::Pending,
            actual: OutboxState::AckPending,
        }
        .into();
        match invalid {
            OutboxError::InvalidState(msg) => assert!(msg.contains("ack_pending")),
            other => panic!("unexpected error: {other}"),
        }

        let storage: OutboxError = DatabaseError::Connection("closed".into()).into();
        assert!(matches!(storage, OutboxError::Storage(_)));
    }
}
