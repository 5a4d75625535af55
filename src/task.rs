use std::future::Future;
use std::time::Duration;

use crate::context::ExecutionContext;

/// The trait for defining tasks, the named units of business logic a job
/// runs.
///
/// A task receives the [`ExecutionContext`] built from its job and returns a
/// new context describing what happens next:
///
/// - [`ExecutionStatus::Completed`](crate::ExecutionStatus::Completed): the
///   job is finished and its row is deleted; other fields are ignored.
/// - [`ExecutionStatus::InProgress`](crate::ExecutionStatus::InProgress)
///   with `should_retry` unset: the returned task name, start time, and
///   payload designate the next step. Returning the same name re-runs this
///   step at the returned time; a different name advances the workflow.
/// - [`ExecutionStatus::InProgress`](crate::ExecutionStatus::InProgress)
///   with `should_retry` set: asks for a backoff retry of this task,
///   honoured while the job's retry budget lasts and the task declares a
///   [`retry_schedule`](Task::retry_schedule).
///
/// Returning an `Err` (or panicking) rolls back the transaction and releases
/// the lease; the job is re-leased on a later poll. This does **not** consume
/// the retry budget.
///
/// Delivery is at-least-once: a crash between a task's side effects and the
/// transaction commit re-delivers the same input, so tasks must tolerate
/// running more than once on the same job.
pub trait Task: Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application; jobs reference their
    /// task by this name.
    const NAME: &'static str;

    /// Run one step of the job.
    fn execute(
        &self,
        ctx: ExecutionContext,
    ) -> impl Future<Output = anyhow::Result<ExecutionContext>> + Send;

    /// The backoff schedule for this task, or `None` if it is not retryable.
    ///
    /// The schedule's length is the total retry budget for one invocation of
    /// this task on a given job, and each entry is the wait before the
    /// corresponding attempt: with `[10s, 20s, 30s]` the first retry waits
    /// 10s, the second 20s, the third 30s.
    fn retry_schedule() -> Option<Vec<Duration>> {
        None
    }
}
