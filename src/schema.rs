//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the durable job store.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted unit of work, the sole entity of the store.
///
/// A job names the task to run next, the earliest time it may run, and an
/// opaque JSON payload carried between workflow steps. While a worker holds
/// the job, `worker_id` and `worker_lock_time` are both set; an unleased job
/// has neither. Completion is represented by deleting the row.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identity, assigned at insert.
    pub job_id: Uuid,
    /// Identity of the lease holder, absent while the job is unleased.
    pub worker_id: Option<Uuid>,
    /// When the current lease was taken; set and cleared together with
    /// `worker_id`.
    pub worker_lock_time: Option<DateTime<Utc>>,
    /// Name of the task to run next.
    pub assigned_task_name: String,
    /// Earliest wall-clock time the task may run.
    pub assigned_task_start_time: DateTime<Utc>,
    /// Opaque JSON payload carried between workflow steps.
    pub job_data: Option<Value>,
    /// How many further retries of the current task are permitted.
    pub retry_attempts_remaining: i32,
    /// Priority in `1..=10`, where 1 is highest. Defaults to 10.
    pub priority: i16,
}
