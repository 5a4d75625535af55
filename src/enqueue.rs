use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::errors::EnqueueError;
use crate::registry::TaskRegistry;
use crate::schema::Job;
use crate::storage;

/// Priority assigned when the submitter does not specify one (the lowest).
pub(crate) const DEFAULT_PRIORITY: i16 = 10;

/// Submit a job for execution.
///
/// Builds an unleased [`Job`] from the context: the retry budget comes from
/// the registry's schedule for the named task, and the priority falls back
/// to 10 when the context does not carry one. The job is picked up by the
/// [`Coordinator`](crate::Coordinator) once its start time passes.
///
/// Returns the id of the inserted job.
#[instrument(name = "conveyor.enqueue", skip_all)]
pub async fn enqueue(
    pool: &PgPool,
    registry: &TaskRegistry,
    context: &ExecutionContext,
) -> Result<Uuid, EnqueueError> {
    let job = job_from_context(registry, context)?;
    storage::insert_job(pool, &job).await?;

    debug!(job.id = %job.job_id, task.name = %job.assigned_task_name, "Enqueued job");
    Ok(job.job_id)
}

fn job_from_context(
    registry: &TaskRegistry,
    context: &ExecutionContext,
) -> Result<Job, EnqueueError> {
    let task_name = context
        .assigned_task_name()
        .ok_or(EnqueueError::MissingTaskName)?;
    let start_time = context
        .assigned_task_start_time()
        .ok_or(EnqueueError::MissingStartTime)?;

    let priority = context.priority().unwrap_or(DEFAULT_PRIORITY);
    if !(1..=10).contains(&priority) {
        return Err(EnqueueError::InvalidPriority(priority));
    }

    Ok(Job {
        job_id: Uuid::new_v4(),
        worker_id: None,
        worker_lock_time: None,
        assigned_task_name: task_name.to_owned(),
        assigned_task_start_time: start_time,
        job_data: context.job_data().cloned(),
        retry_attempts_remaining: registry.retry_attempts_for(task_name),
        priority,
    })
}
