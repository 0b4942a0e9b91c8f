//! Stats error types.

use thiserror::Error;

/// Errors surfaced to callers of the stats registry.
///
/// Store failures never reach `record`/`estimate` callers: the persistence
/// pipeline retries them in the background.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type StatsResult<T> = Result<T, StatsError>;
