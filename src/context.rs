use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::ContextBuildError;
use crate::schema::Job;

/// Lifecycle stage of one task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Handed to a task when it begins. Not a valid return value.
    Started,
    /// The job continues: advance the workflow, reschedule the same step,
    /// or (with `should_retry`) back off and retry.
    InProgress,
    /// The job is finished and its row will be deleted.
    Completed,
}

/// The immutable value passed to and returned from tasks.
///
/// An `ExecutionContext` is constructed through [`ExecutionContext::builder`]
/// and never mutated; a task derives its return value from the input via
/// [`ExecutionContext::to_builder`]. A context asking for a retry must carry
/// the payload, task name, and start time to fall back on once the retry
/// budget is spent, which [`ExecutionContextBuilder::build`] enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    job_data: Option<Value>,
    assigned_task_name: Option<String>,
    assigned_task_start_time: Option<DateTime<Utc>>,
    execution_status: ExecutionStatus,
    should_retry: bool,
    priority: Option<i16>,
}

impl ExecutionContext {
    /// Start building a context from scratch.
    pub fn builder() -> ExecutionContextBuilder {
        ExecutionContextBuilder::default()
    }

    /// The input context for a leased job: status [`ExecutionStatus::Started`],
    /// remaining fields copied from the row.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_data: job.job_data.clone(),
            assigned_task_name: Some(job.assigned_task_name.clone()),
            assigned_task_start_time: Some(job.assigned_task_start_time),
            execution_status: ExecutionStatus::Started,
            should_retry: false,
            priority: Some(job.priority),
        }
    }

    /// A builder pre-populated with this context's fields.
    pub fn to_builder(&self) -> ExecutionContextBuilder {
        ExecutionContextBuilder {
            job_data: self.job_data.clone(),
            assigned_task_name: self.assigned_task_name.clone(),
            assigned_task_start_time: self.assigned_task_start_time,
            execution_status: self.execution_status,
            should_retry: self.should_retry,
            priority: self.priority,
        }
    }

    /// The JSON payload, if any.
    pub fn job_data(&self) -> Option<&Value> {
        self.job_data.as_ref()
    }

    /// The task this context designates.
    pub fn assigned_task_name(&self) -> Option<&str> {
        self.assigned_task_name.as_deref()
    }

    /// The earliest time the designated task may run.
    pub fn assigned_task_start_time(&self) -> Option<DateTime<Utc>> {
        self.assigned_task_start_time
    }

    /// Where this invocation stands in its lifecycle.
    pub fn execution_status(&self) -> ExecutionStatus {
        self.execution_status
    }

    /// Whether the task asks for a backoff retry of itself.
    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    /// The job priority, if the submitter specified one.
    pub fn priority(&self) -> Option<i16> {
        self.priority
    }
}

/// Builder for [`ExecutionContext`].
#[derive(Debug, Clone)]
pub struct ExecutionContextBuilder {
    job_data: Option<Value>,
    assigned_task_name: Option<String>,
    assigned_task_start_time: Option<DateTime<Utc>>,
    execution_status: ExecutionStatus,
    should_retry: bool,
    priority: Option<i16>,
}

impl Default for ExecutionContextBuilder {
    fn default() -> Self {
        Self {
            job_data: None,
            assigned_task_name: None,
            assigned_task_start_time: None,
            execution_status: ExecutionStatus::Started,
            should_retry: false,
            priority: None,
        }
    }
}

impl ExecutionContextBuilder {
    /// Set the JSON payload.
    pub fn job_data(mut self, job_data: Value) -> Self {
        self.job_data = Some(job_data);
        self
    }

    /// Set the task name.
    pub fn assigned_task_name(mut self, name: impl Into<String>) -> Self {
        self.assigned_task_name = Some(name.into());
        self
    }

    /// Set the earliest time the task may run.
    pub fn assigned_task_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.assigned_task_start_time = Some(start_time);
        self
    }

    /// Set the execution status.
    pub fn execution_status(mut self, status: ExecutionStatus) -> Self {
        self.execution_status = status;
        self
    }

    /// Ask for a backoff retry of the current task.
    pub fn should_retry(mut self, should_retry: bool) -> Self {
        self.should_retry = should_retry;
        self
    }

    /// Set the job priority (`1..=10`, 1 is highest).
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Validate and build the context.
    ///
    /// A retryable context (`should_retry`) must carry the payload, task
    /// name, and start time used when the retry budget runs out.
    pub fn build(self) -> Result<ExecutionContext, ContextBuildError> {
        let retry_fallback_missing = self.job_data.is_none()
            || self.assigned_task_name.is_none()
            || self.assigned_task_start_time.is_none();

        if self.should_retry && retry_fallback_missing {
            return Err(ContextBuildError::MissingRetryFields);
        }

        Ok(ExecutionContext {
            job_data: self.job_data,
            assigned_task_name: self.assigned_task_name,
            assigned_task_start_time: self.assigned_task_start_time,
            execution_status: self.execution_status,
            should_retry: self.should_retry,
            priority: self.priority,
        })
    }
}
