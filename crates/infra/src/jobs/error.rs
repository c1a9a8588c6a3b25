//! Job and engine error types.

use collectionjobs_core::JobId;

use crate::storage::StoreError;

/// Failure while handling one message.
///
/// Any of these ends the worker iteration: the unit of work is rolled back and the
/// job record keeps the progress of its last committed batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
}

/// Engine lifecycle and submission errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,
    #[error("engine is already initialized")]
    AlreadyInitialized,
    #[error("engine has been shut down")]
    ShutDown,
    #[error("job {0} already has a message in flight")]
    JobAlreadyQueued(JobId),
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
