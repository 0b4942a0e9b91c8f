//! Error types for the profile store.

use thiserror::Error;

/// Result type alias for profile store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors a backing store can report.
///
/// Every variant is treated as transient by the persistence pipeline: the
/// failed write or read is requeued and retried after a backoff.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
