use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinSet;
use tracing::{error, warn};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic sweep that frees leases abandoned by crashed workers.
///
/// A worker that dies between taking a lease and finishing its transaction
/// leaves the row leased forever; the same happens when a fatal store error
/// makes a worker give up on a job. The reaper clears any lease older than
/// `max_lease_age`, returning those rows to the pollable pool. Size the
/// threshold well above the longest task you run, since a reaped lease means
/// a second, concurrent delivery if the original worker is in fact alive.
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseReaper {
    sweep_interval: Duration,
    max_lease_age: chrono::Duration,
}

impl Default for LeaseReaper {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_lease_age: chrono::Duration::minutes(10),
        }
    }
}

impl LeaseReaper {
    /// Create a reaper with the default sweep interval (60s) and lease age
    /// threshold (10 minutes).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how often the sweep runs.
    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Set the age past which a lease counts as abandoned.
    pub fn max_lease_age(mut self, max_lease_age: chrono::Duration) -> Self {
        self.max_lease_age = max_lease_age;
        self
    }

    /// Start the sweep, returning a `JoinSet` containing the spawned task
    /// for easy cancellation.
    pub fn start(self, pool: &PgPool) -> JoinSet<()> {
        let mut set = JoinSet::new();
        set.spawn(Self::sweep_loop(
            self.sweep_interval,
            self.max_lease_age,
            pool.clone(),
        ));
        set
    }

    async fn sweep_loop(sweep_interval: Duration, max_lease_age: chrono::Duration, pool: PgPool) {
        let mut ticker = tokio::time::interval(sweep_interval);

        loop {
            ticker.tick().await;

            let result = sqlx::query(
                "UPDATE jobs SET worker_id = NULL, worker_lock_time = NULL \
                 WHERE worker_lock_time < (NOW() - $1)",
            )
            .bind(max_lease_age)
            .execute(&pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => {
                    warn!(count = done.rows_affected(), "Released expired job leases");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to sweep expired leases: {}", e);
                    break;
                }
            }
        }
    }
}
