use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::task::Task;

type ExecuteFn =
    Box<dyn Fn(ExecutionContext) -> BoxFuture<'static, anyhow::Result<ExecutionContext>> + Send + Sync>;

/// A task implementation with its type erased for name-based dispatch.
pub(crate) struct RegisteredTask {
    execute: ExecuteFn,
    retry_schedule: Option<Vec<Duration>>,
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("retry_schedule", &self.retry_schedule)
            .finish_non_exhaustive()
    }
}

impl RegisteredTask {
    pub(crate) fn execute(
        &self,
        ctx: ExecutionContext,
    ) -> BoxFuture<'static, anyhow::Result<ExecutionContext>> {
        (self.execute)(ctx)
    }

    pub(crate) fn retry_schedule(&self) -> Option<&[Duration]> {
        self.retry_schedule.as_deref()
    }
}

/// Process-wide mapping from task name to implementation.
///
/// The registry is populated once at startup, before the
/// [`Coordinator`](crate::Coordinator) begins polling, and is read-only
/// afterwards. The first registration for a given name wins; later
/// duplicates are ignored.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under [`Task::NAME`].
    pub fn register<T: Task>(mut self, task: T) -> Self {
        match self.tasks.entry(T::NAME.to_owned()) {
            Entry::Occupied(_) => {
                debug!(task.name = T::NAME, "Ignoring duplicate task registration");
            }
            Entry::Vacant(entry) => {
                let task = Arc::new(task);
                entry.insert(RegisteredTask {
                    execute: Box::new(move |ctx| {
                        let task = Arc::clone(&task);
                        async move { task.execute(ctx).await }.boxed()
                    }),
                    retry_schedule: T::retry_schedule(),
                });
                info!(task.name = T::NAME, "Registered task");
            }
        }
        self
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    /// The retry budget for the named task: the length of its retry
    /// schedule, or 0 if the name is unknown or the task declares none.
    pub fn retry_attempts_for(&self, name: &str) -> i32 {
        self.lookup(name)
            .and_then(RegisteredTask::retry_schedule)
            .map_or(0, |schedule| schedule.len() as i32)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionStatus;
    use claims::{assert_none, assert_some};

    struct Retryable;

    impl Task for Retryable {
        const NAME: &'static str = "RETRYABLE";

        async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<ExecutionContext> {
            Ok(ctx)
        }

        fn retry_schedule() -> Option<Vec<Duration>> {
            Some(vec![Duration::from_secs(10), Duration::from_secs(20)])
        }
    }

    struct OneShot;

    impl Task for OneShot {
        const NAME: &'static str = "ONE_SHOT";

        async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<ExecutionContext> {
            Ok(ctx
                .to_builder()
                .execution_status(ExecutionStatus::Completed)
                .build()?)
        }
    }

    struct OneShotImpostor;

    impl Task for OneShotImpostor {
        const NAME: &'static str = "ONE_SHOT";

        async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<ExecutionContext> {
            Ok(ctx)
        }

        fn retry_schedule() -> Option<Vec<Duration>> {
            Some(vec![Duration::from_secs(1)])
        }
    }

    #[test]
    fn lookup_finds_registered_tasks() {
        let registry = TaskRegistry::new().register(Retryable).register(OneShot);

        assert_some!(registry.lookup("RETRYABLE"));
        assert_some!(registry.lookup("ONE_SHOT"));
        assert_none!(registry.lookup("UNKNOWN"));
    }

    #[test]
    fn retry_budget_is_the_schedule_length() {
        let registry = TaskRegistry::new().register(Retryable).register(OneShot);

        assert_eq!(registry.retry_attempts_for("RETRYABLE"), 2);
        assert_eq!(registry.retry_attempts_for("ONE_SHOT"), 0);
        assert_eq!(registry.retry_attempts_for("UNKNOWN"), 0);
    }

    #[test]
    fn first_registration_wins() {
        let registry = TaskRegistry::new()
            .register(OneShot)
            .register(OneShotImpostor);

        // The impostor's schedule must not be visible.
        assert_eq!(registry.retry_attempts_for("ONE_SHOT"), 0);
    }
}
