use thiserror::Error;

/// Errors about the queue itself: bad input, unknown jobs, storage failures.
/// Errors about individual job *executions* (nonzero exit, timeout) are not
/// part of this enum - per the state machine, those are data, not control flow,
/// and are recorded on the job record rather than surfaced as a `Result::Err`.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("a job with id {0} already exists")]
    DuplicateId(String),

    #[error("no job with id {0} exists")]
    UnknownJobId(String),

    #[error("job {0} is not in the dead state, refusing to retry")]
    NotDead(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
