use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::context::{ExecutionContext, ExecutionStatus};
use crate::errors::is_transient;
use crate::registry::{RegisteredTask, TaskRegistry};
use crate::schema::Job;
use crate::storage;

/// Executes exactly one leased job to its next persisted state.
///
/// The worker looks the job's task up in the registry, runs it inside a
/// single database transaction, and applies the store mutation the returned
/// context asks for: delete on completion, a backoff retry, or an advance of
/// the task selector. Any failure rolls the transaction back and releases
/// the lease on a best-effort basis, so the job can be leased again later.
pub struct Worker {
    pool: PgPool,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
}

enum RunError {
    /// The task body returned an error or panicked. The schedule-driven
    /// retry budget is not consumed by this.
    Task(anyhow::Error),
    /// The store failed while persisting the outcome.
    Store(sqlx::Error),
}

impl From<sqlx::Error> for RunError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(error)
    }
}

impl Worker {
    /// Create a worker bound to the given store, registry, and clock.
    pub fn new(pool: PgPool, registry: Arc<TaskRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            registry,
            clock,
        }
    }

    /// Run a leased job to its next persisted state.
    ///
    /// Never propagates job-level failures to the caller: every error path
    /// compensates through the store or is logged.
    pub async fn run_job(&self, job: Job) {
        let span = info_span!("job", job.id = %job.job_id, task.name = %job.assigned_task_name);
        self.run_job_inner(&job).instrument(span).await;
    }

    async fn run_job_inner(&self, job: &Job) {
        let Some(task) = self.registry.lookup(&job.assigned_task_name) else {
            error!("No task registered to process this job");
            self.release_quietly(job.job_id).await;
            return;
        };

        let now = self.clock.now();
        if job.assigned_task_start_time > now {
            // Leased ahead of time, e.g. through clock skew between nodes.
            debug!("Task start time not reached yet, releasing the lease");
            self.release_quietly(job.job_id).await;
            return;
        }

        debug!("Running job…");
        match self.execute_in_transaction(job, task, now).await {
            Ok(()) => {}
            Err(RunError::Task(task_error)) => {
                warn!(error = %task_error, "Task failed, transaction rolled back");
                self.release_quietly(job.job_id).await;
            }
            Err(RunError::Store(store_error)) if is_transient(&store_error) => {
                warn!(error = %store_error, "Store conflict, transaction rolled back");
                self.release_quietly(job.job_id).await;
            }
            Err(RunError::Store(store_error)) => {
                // The lease stays put; a reaper sweep frees it eventually.
                error!(error = %store_error, "Store failure, leaving the job leased");
            }
        }
    }

    /// Invoke the task and persist the outcome it asks for, all inside one
    /// transaction. Dropping the transaction on the error path is the
    /// rollback.
    async fn execute_in_transaction(
        &self,
        job: &Job,
        task: &RegisteredTask,
        now: DateTime<Utc>,
    ) -> Result<(), RunError> {
        let mut tx = self.pool.begin().await?;

        let input = ExecutionContext::from_job(job);
        let outcome = AssertUnwindSafe(task.execute(input))
            .catch_unwind()
            .await
            .map_err(|panic| try_to_extract_panic_info(&*panic))
            // TODO: Replace with flatten() once that stabilizes
            .and_then(std::convert::identity)
            .map_err(RunError::Task)?;

        match outcome.execution_status() {
            ExecutionStatus::Completed => {
                debug!("Task completed, deleting job");
                storage::delete_job(&mut *tx, job.job_id).await?;
            }
            ExecutionStatus::InProgress => {
                self.persist_progress(&mut tx, job, task, &outcome, now)
                    .await?;
            }
            ExecutionStatus::Started => {
                return Err(RunError::Task(anyhow!(
                    "task returned the STARTED status, which is only valid on input"
                )));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn persist_progress(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        task: &RegisteredTask,
        outcome: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<(), RunError> {
        if outcome.should_retry() {
            if let Some(delay) =
                next_retry_delay(task.retry_schedule(), job.retry_attempts_remaining)
            {
                let next_start = now + delay;
                let attempts_left = job.retry_attempts_remaining - 1;
                debug!(
                    delay.secs = delay.as_secs(),
                    attempts.remaining = attempts_left,
                    "Scheduling retry"
                );
                storage::schedule_retry(&mut **tx, job.job_id, next_start, attempts_left).await?;
                storage::release_job(&mut **tx, job.job_id).await?;
                return Ok(());
            }
            debug!("Retry requested but not possible, falling through to the next step");
        }

        let next_name = outcome.assigned_task_name().ok_or_else(|| {
            RunError::Task(anyhow!("an in-progress context must name the next task"))
        })?;
        let next_start = outcome.assigned_task_start_time().ok_or_else(|| {
            RunError::Task(anyhow!("an in-progress context must carry a start time"))
        })?;

        // Same step rescheduled later keeps its budget; a new step gets the
        // registry's budget for the new name.
        let attempts_left = if next_name == job.assigned_task_name {
            job.retry_attempts_remaining
        } else {
            self.registry.retry_attempts_for(next_name)
        };

        debug!(
            task.next = %next_name,
            attempts.remaining = attempts_left,
            "Updating job with its next task"
        );
        storage::update_job_data(&mut **tx, job.job_id, outcome.job_data()).await?;
        storage::update_next_task(&mut **tx, job.job_id, next_name, next_start, attempts_left)
            .await?;
        storage::release_job(&mut **tx, job.job_id).await?;
        Ok(())
    }

    /// Best-effort lease release in its own transaction. A failure here must
    /// not cascade, so it is only logged.
    async fn release_quietly(&self, job_id: Uuid) {
        if let Err(error) = storage::release_job(&self.pool, job_id).await {
            error!(job.id = %job_id, %error, "Failed to release the job lease");
        }
    }
}

/// Delay before the next retry.
///
/// The schedule is indexed from the front as the budget shrinks: with
/// `[10s, 20s, 30s]` and 3 attempts remaining the next retry waits 10s,
/// with 2 remaining 20s, with 1 remaining 30s. `None` when the task has no
/// schedule, the budget is spent, or the counter exceeds the schedule.
fn next_retry_delay(schedule: Option<&[Duration]>, attempts_remaining: i32) -> Option<Duration> {
    let schedule = schedule?;
    if attempts_remaining <= 0 {
        return None;
    }
    let index = schedule.len().checked_sub(attempts_remaining as usize)?;
    schedule.get(index).copied()
}

fn try_to_extract_panic_info(panic: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = panic.downcast_ref::<String>() {
        anyhow!("task panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        anyhow!("task panicked: {message}")
    } else {
        anyhow!("task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_some_eq};

    const SCHEDULE: &[Duration] = &[
        Duration::from_secs(10),
        Duration::from_secs(20),
        Duration::from_secs(30),
    ];

    #[test]
    fn delays_walk_the_schedule_front_to_back() {
        assert_some_eq!(
            next_retry_delay(Some(SCHEDULE), 3),
            Duration::from_secs(10)
        );
        assert_some_eq!(
            next_retry_delay(Some(SCHEDULE), 2),
            Duration::from_secs(20)
        );
        assert_some_eq!(
            next_retry_delay(Some(SCHEDULE), 1),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn spent_budget_yields_no_delay() {
        assert_none!(next_retry_delay(Some(SCHEDULE), 0));
        assert_none!(next_retry_delay(Some(SCHEDULE), -1));
    }

    #[test]
    fn tasks_without_a_schedule_are_not_retryable() {
        assert_none!(next_retry_delay(None, 3));
        assert_none!(next_retry_delay(Some(&[]), 1));
    }

    #[test]
    fn counter_beyond_the_schedule_yields_no_delay() {
        assert_none!(next_retry_delay(Some(SCHEDULE), 4));
    }

    #[test]
    fn panic_messages_are_preserved() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            try_to_extract_panic_info(&*boxed).to_string(),
            "task panicked: boom"
        );

        let boxed: Box<dyn Any + Send> = Box::new("boom".to_owned());
        assert_eq!(
            try_to_extract_panic_info(&*boxed).to_string(),
            "task panicked: boom"
        );

        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(try_to_extract_panic_info(&*boxed).to_string(), "task panicked");
    }
}
