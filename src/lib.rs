#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod clock;
mod context;
mod coordinator;
mod enqueue;
mod errors;
mod reaper;
mod registry;
/// Database schema definitions.
pub mod schema;
mod storage;
mod task;
mod worker;

/// Wall-clock abstraction; inject a fake in tests.
pub use self::clock::{Clock, SystemClock};
/// The value handed to and returned from tasks.
pub use self::context::{ExecutionContext, ExecutionContextBuilder, ExecutionStatus};
/// The polling loop that leases jobs and dispatches them to workers.
pub use self::coordinator::{Coordinator, CoordinatorHandle};
/// Job submission.
pub use self::enqueue::enqueue;
/// Error types for the public surface.
pub use self::errors::{ContextBuildError, EnqueueError};
/// Sweeper that frees leases abandoned by crashed workers.
pub use self::reaper::LeaseReaper;
/// Name-to-task mapping, built once at startup.
pub use self::registry::TaskRegistry;
/// The trait for defining tasks.
pub use self::task::Task;
/// Executes a single leased job.
pub use self::worker::Worker;

/// Create the `jobs` table and its indexes by running the bundled migrations.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
