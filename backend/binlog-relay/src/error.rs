//! Error types for the binlog relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while relaying change events.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Status query against the source database failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Replication stream could not be opened or read
    #[error("Replication stream error: {0}")]
    StreamError(#[from] mysql_async::Error),

    /// Checkpoint backend rejected a read or write
    #[error("Checkpoint storage error: {0}")]
    CheckpointStorage(String),

    /// Sink refused or failed a batch delivery
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Environment configuration is missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("Relay error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<envy::Error> for RelayError {
    fn from(err: envy::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}
