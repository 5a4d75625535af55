use thiserror::Error;

/// Error type for job submission.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The context names no task.
    #[error("cannot enqueue a job without a task name")]
    MissingTaskName,
    /// The context carries no start time.
    #[error("cannot enqueue a job without a start time")]
    MissingStartTime,
    /// The priority is outside the accepted range.
    #[error("priority {0} is outside the accepted range 1..=10")]
    InvalidPriority(i16),
    /// The insert failed.
    #[error("database error")]
    Database(#[from] sqlx::Error),
}

/// Error type for [`ExecutionContextBuilder::build`](crate::ExecutionContextBuilder::build).
#[derive(Debug, Error)]
pub enum ContextBuildError {
    /// A retryable context must carry the fields to fall back on once the
    /// retry budget is spent.
    #[error(
        "a retryable context requires job data, a task name, and a start time"
    )]
    MissingRetryFields,
}

/// Whether a store error is worth retrying on a later poll.
///
/// Serialization failures, deadlocks, lock-not-available, and pool timeouts
/// resolve themselves; anything else is treated as fatal for the current job.
pub(crate) fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_error) => matches!(
            db_error.code().as_deref(),
            Some("40001" | "40P01" | "55P03")
        ),
        _ => false,
    }
}
