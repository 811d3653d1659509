use std::time::Duration;

use thiserror::Error;

use crate::item::WorkItemId;

/// Failures talking to the lock store. Contention is not an error; it is
/// reported as `Ok(None)` by [`crate::lock::LockManager::try_acquire`].
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock store unreachable: {0}")]
    Unavailable(String),

    #[error("unexpected lock store reply: {0}")]
    Protocol(String),

    #[error("lock TTL {0:?} is out of range")]
    InvalidTtl(Duration),
}

#[cfg(feature = "database")]
impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            LockError::Unavailable(err.to_string())
        } else {
            LockError::Protocol(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("work item not found: {0}")]
    NotFound(WorkItemId),

    #[error("failed to decode work item {id}: {reason}")]
    Decode { id: String, reason: String },

    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Classified failure of a single action execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Worth retrying on a later run (network blips, 5xx, throttling).
    #[error("transient action failure: {0}")]
    Transient(String),

    /// Retrying will not help (rejected offer, validation failure).
    #[error("permanent action failure: {0}")]
    Permanent(String),

    #[error("action timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

impl ActionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ActionError::Transient(_) | ActionError::TimedOut(_) => true,
            ActionError::Permanent(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Action(#[from] ActionError),
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Lock(_) | WorkerError::Repository(_) => true,
            WorkerError::Action(err) => err.is_retryable(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
