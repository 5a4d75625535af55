use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgExecutor, Postgres, Transaction};
use uuid::Uuid;

use crate::schema::Job;

/// Returns up to `limit` unleased jobs whose start time has passed, ordered
/// by priority (1 first) and then start time.
///
/// The rows come back write-locked for the lifetime of `tx`; rows locked by
/// another session are skipped rather than waited on, so concurrent pollers
/// never lease the same job twice.
pub(crate) async fn lease_candidates(
    tx: &mut Transaction<'_, Postgres>,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r"
        SELECT job_id, worker_id, worker_lock_time, assigned_task_name,
               assigned_task_start_time, job_data, retry_attempts_remaining, priority
        FROM jobs
        WHERE worker_id IS NULL
          AND assigned_task_start_time <= $1
        ORDER BY priority ASC, assigned_task_start_time ASC
        FOR UPDATE SKIP LOCKED
        LIMIT $2
        ",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut **tx)
    .await
}

/// Sets both lease fields on an unleased job. Returns `None` if the row no
/// longer exists or another scheduler leased it first.
pub(crate) async fn assign_job(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
    worker_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r"
        UPDATE jobs SET worker_id = $2, worker_lock_time = $3
        WHERE job_id = $1 AND worker_id IS NULL
        RETURNING job_id, worker_id, worker_lock_time, assigned_task_name,
                  assigned_task_start_time, job_data, retry_attempts_remaining, priority
        ",
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(now)
    .fetch_optional(executor)
    .await
}

/// Takes one retry attempt off a job's budget, if it has any left.
///
/// Compensation when assignment fails before a worker takes over.
pub(crate) async fn decrement_retry_attempts(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE jobs SET retry_attempts_remaining = retry_attempts_remaining - 1 \
         WHERE job_id = $1 AND retry_attempts_remaining > 0",
    )
    .bind(job_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Replaces a job's payload.
pub(crate) async fn update_job_data(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
    job_data: Option<&Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET job_data = $2 WHERE job_id = $1")
        .bind(job_id)
        .bind(job_data)
        .execute(executor)
        .await?;
    Ok(())
}

/// Rewrites the task selector in one statement: which task runs next, when
/// it may start, and with what retry budget.
pub(crate) async fn update_next_task(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
    task_name: &str,
    start_time: DateTime<Utc>,
    retry_attempts_remaining: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE jobs SET assigned_task_name = $2, assigned_task_start_time = $3, \
         retry_attempts_remaining = $4 WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(task_name)
    .bind(start_time)
    .bind(retry_attempts_remaining)
    .execute(executor)
    .await?;
    Ok(())
}

/// Pushes a job's start time out and updates its retry budget without
/// changing the task name.
pub(crate) async fn schedule_retry(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
    start_time: DateTime<Utc>,
    retry_attempts_remaining: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE jobs SET assigned_task_start_time = $2, retry_attempts_remaining = $3 \
         WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(start_time)
    .bind(retry_attempts_remaining)
    .execute(executor)
    .await?;
    Ok(())
}

/// Clears both lease fields, returning the job to the pollable pool.
pub(crate) async fn release_job(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET worker_id = NULL, worker_lock_time = NULL WHERE job_id = $1")
        .bind(job_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Removes a finished job.
pub(crate) async fn delete_job(
    executor: impl PgExecutor<'_>,
    job_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Persists a new job row.
pub(crate) async fn insert_job(
    executor: impl PgExecutor<'_>,
    job: &Job,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO jobs (job_id, worker_id, worker_lock_time, assigned_task_name,
                          assigned_task_start_time, job_data, retry_attempts_remaining, priority)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ",
    )
    .bind(job.job_id)
    .bind(job.worker_id)
    .bind(job.worker_lock_time)
    .bind(&job.assigned_task_name)
    .bind(job.assigned_task_start_time)
    .bind(&job.job_data)
    .bind(job.retry_attempts_remaining)
    .bind(job.priority)
    .execute(executor)
    .await?;
    Ok(())
}
