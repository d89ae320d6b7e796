use thiserror::Error;

/// Errors at the runtime-process boundary: wraps core queue errors plus the
/// failure modes that only exist once a job is handed to an OS subprocess or
/// a worker is spawned as its own OS process.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Queue(#[from] queuectl_core::QueueError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn worker process: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
