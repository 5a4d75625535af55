use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::registry::TaskRegistry;
use crate::schema::Job;
use crate::storage;
use crate::worker::Worker;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_CORE_POOL_SIZE: usize = 5;
const DEFAULT_MAX_POOL_SIZE: usize = 10;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_WORKER_NAME_PREFIX: &str = "conveyor-worker-";
const DEFAULT_AWAIT_TERMINATION: Duration = Duration::from_secs(60);

/// The scheduled poller that turns calendar ticks into worker invocations.
///
/// Each tick leases up to a batch of ready jobs in priority order inside one
/// transaction, then hands every leased job to a bounded pool of workers.
/// Ticks run with a fixed delay: a long tick postpones the next one rather
/// than overlapping it.
pub struct Coordinator {
    pool: PgPool,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    poll_jitter: Duration,
    batch_size: usize,
    core_pool_size: usize,
    max_pool_size: usize,
    queue_capacity: usize,
    worker_name_prefix: String,
    wait_for_tasks_on_shutdown: bool,
    await_termination: Duration,
    shutdown_when_idle: bool,
}

impl Coordinator {
    /// Create a coordinator with default configuration.
    pub fn new(pool: PgPool, registry: TaskRegistry) -> Self {
        Self {
            pool,
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_jitter: Duration::ZERO,
            batch_size: DEFAULT_BATCH_SIZE,
            core_pool_size: DEFAULT_CORE_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_owned(),
            wait_for_tasks_on_shutdown: true,
            await_termination: DEFAULT_AWAIT_TERMINATION,
            shutdown_when_idle: false,
        }
    }

    /// Set the fixed delay between polling ticks.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to each polling delay.
    ///
    /// Jitter de-synchronizes multiple scheduler processes polling the same
    /// table. The applied jitter is a random value between zero and the
    /// given duration.
    pub fn poll_jitter(mut self, poll_jitter: Duration) -> Self {
        self.poll_jitter = poll_jitter;
        self
    }

    /// Set the maximum number of jobs leased per tick.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the steady-state worker concurrency.
    pub fn core_pool_size(mut self, core_pool_size: usize) -> Self {
        self.core_pool_size = core_pool_size;
        self
    }

    /// Set the peak worker concurrency reached when the queue is saturated.
    pub fn max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// Set how many dispatched jobs may wait for a worker slot.
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the prefix of worker names in the logs.
    pub fn worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Choose whether shutdown waits for in-flight workers (the default) or
    /// aborts them.
    pub fn wait_for_tasks_on_shutdown(mut self, wait: bool) -> Self {
        self.wait_for_tasks_on_shutdown = wait;
        self
    }

    /// Set the ceiling on how long a graceful shutdown waits for in-flight
    /// workers.
    pub fn await_termination(mut self, grace: Duration) -> Self {
        self.await_termination = grace;
        self
    }

    /// Stop polling after a tick that found no ready jobs.
    ///
    /// Useful for tests and batch runs that drain a queue and exit.
    pub fn shutdown_when_idle(mut self) -> Self {
        self.shutdown_when_idle = true;
        self
    }

    /// Override the wall clock, for deterministic tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start polling.
    ///
    /// Returns a handle used to wait for or trigger shutdown.
    pub fn start(self) -> CoordinatorHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle =
            tokio::spawn(async move { self.run(loop_token).await }.instrument(info_span!("coordinator")));
        CoordinatorHandle { token, handle }
    }

    async fn run(self, token: CancellationToken) {
        let worker_pool = WorkerPool::new(
            self.core_pool_size,
            self.max_pool_size,
            self.queue_capacity,
        );
        let worker = Arc::new(Worker::new(
            self.pool.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
        ));
        let mut workers = JoinSet::new();

        info!("Starting job polling…");
        loop {
            // Reap workers that finished since the last tick.
            while workers.try_join_next().is_some() {}

            match self.lease_batch().await {
                Ok(batch) if batch.is_empty() && self.shutdown_when_idle => {
                    debug!("No ready jobs found. Shutting down the coordinator…");
                    break;
                }
                Ok(batch) if batch.is_empty() => {
                    trace!("No ready jobs found");
                }
                Ok(batch) => {
                    debug!(count = batch.len(), "Leased jobs");
                    for job in batch {
                        self.dispatch(&worker_pool, &mut workers, &worker, job).await;
                    }
                }
                Err(error) => {
                    error!(%error, "Polling tick failed");
                }
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = sleep(self.sleep_duration_with_jitter()) => {}
            }
        }

        self.drain(workers).await;
    }

    /// Lease up to a batch of ready jobs.
    ///
    /// The candidate query takes its row locks in a short transaction of its
    /// own; each assignment is then a separate conditional statement, so a
    /// row another scheduler grabbed in between simply fails to assign and is
    /// compensated. Only a failure of the candidate query itself ends the
    /// tick.
    async fn lease_batch(&self) -> Result<Vec<Job>, sqlx::Error> {
        let now = self.clock.now();

        let mut tx = self.pool.begin().await?;
        let candidates =
            storage::lease_candidates(&mut tx, now, self.batch_size as i64).await?;
        tx.commit().await?;

        let mut assigned = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(job) = self.try_assign(&candidate, now).await {
                assigned.push(job);
            }
        }
        Ok(assigned)
    }

    /// Assign one candidate to a fresh worker identity.
    ///
    /// An assignment that loses the row (deleted, or leased by a concurrent
    /// scheduler) or fails outright is compensated by taking one attempt off
    /// the job's retry budget; neither failure ends the tick.
    async fn try_assign(&self, candidate: &Job, now: DateTime<Utc>) -> Option<Job> {
        let worker_id = Uuid::new_v4();
        match storage::assign_job(&self.pool, candidate.job_id, worker_id, now).await {
            Ok(Some(job)) => {
                debug!(job.id = %job.job_id, worker.id = %worker_id, "Assigned job to worker");
                Some(job)
            }
            Ok(None) => {
                warn!(job.id = %candidate.job_id, "Job already leased or gone, skipping it");
                self.compensate_failed_assignment(candidate.job_id).await;
                None
            }
            Err(error) => {
                error!(job.id = %candidate.job_id, %error, "Failed to assign job");
                self.compensate_failed_assignment(candidate.job_id).await;
                None
            }
        }
    }

    /// Swallows its own failure: compensation must not end the tick.
    async fn compensate_failed_assignment(&self, job_id: Uuid) {
        if let Err(error) = storage::decrement_retry_attempts(&self.pool, job_id).await {
            error!(job.id = %job_id, %error, "Failed to decrement retry attempts");
        }
    }

    async fn dispatch(
        &self,
        worker_pool: &WorkerPool,
        workers: &mut JoinSet<()>,
        worker: &Arc<Worker>,
        job: Job,
    ) {
        let name = format!("{}{}", self.worker_name_prefix, worker_pool.next_worker_number());
        let span = info_span!("worker", worker.name = %name);
        let job_id = job.job_id;

        if worker_pool
            .submit(workers, span, Arc::clone(worker), job)
            .is_err()
        {
            // Queue and overflow slots are all taken; the lease goes back so
            // a later tick can retry the job.
            warn!(job.id = %job_id, "Worker pool saturated, releasing the lease");
            if let Err(error) = storage::release_job(&self.pool, job_id).await {
                error!(job.id = %job_id, %error, "Failed to release the job lease");
            }
        }
    }

    async fn drain(&self, mut workers: JoinSet<()>) {
        if workers.is_empty() {
            return;
        }
        if self.wait_for_tasks_on_shutdown {
            debug!(count = workers.len(), "Waiting for in-flight workers…");
            let drained = tokio::time::timeout(self.await_termination, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Grace period elapsed with workers still running, aborting them");
                workers.shutdown().await;
            }
        } else {
            workers.shutdown().await;
        }
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.poll_jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry)
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .field("core_pool_size", &self.core_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

/// Handle to a running [`Coordinator`].
#[derive(Debug)]
pub struct CoordinatorHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Stop scheduling new ticks and shut the worker pool down according to
    /// the configured policy.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.wait_for_shutdown().await;
    }

    /// Wait for the coordinator to stop on its own (see
    /// [`Coordinator::shutdown_when_idle`]).
    pub async fn wait_for_shutdown(self) {
        if let Err(error) = self.handle.await {
            warn!(%error, "Coordinator task panicked");
        }
    }
}

/// Bounded capacity between the coordinator and its workers.
///
/// `core` permits bound the steady-state concurrency. Jobs beyond that wait
/// in a queue of at most `queue_capacity`. Only once the queue is saturated
/// are `overflow` permits tapped, raising concurrency up to the maximum pool
/// size; past that, submission fails.
struct WorkerPool {
    core: Arc<Semaphore>,
    overflow: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    queue_capacity: usize,
    worker_counter: AtomicU64,
}

struct PoolSaturated;

impl WorkerPool {
    fn new(core_pool_size: usize, max_pool_size: usize, queue_capacity: usize) -> Self {
        Self {
            core: Arc::new(Semaphore::new(core_pool_size)),
            overflow: Arc::new(Semaphore::new(max_pool_size.saturating_sub(core_pool_size))),
            queued: Arc::new(AtomicUsize::new(0)),
            queue_capacity,
            worker_counter: AtomicU64::new(1),
        }
    }

    fn next_worker_number(&self) -> u64 {
        self.worker_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(
        &self,
        workers: &mut JoinSet<()>,
        span: tracing::Span,
        worker: Arc<Worker>,
        job: Job,
    ) -> Result<(), PoolSaturated> {
        if let Ok(permit) = Arc::clone(&self.core).try_acquire_owned() {
            workers.spawn(
                async move {
                    worker.run_job(job).await;
                    drop(permit);
                }
                .instrument(span),
            );
            return Ok(());
        }

        if self.queued.load(Ordering::Acquire) < self.queue_capacity {
            self.queued.fetch_add(1, Ordering::AcqRel);
            let core = Arc::clone(&self.core);
            let queued = Arc::clone(&self.queued);
            workers.spawn(
                async move {
                    let permit = core.acquire_owned().await;
                    queued.fetch_sub(1, Ordering::AcqRel);
                    if permit.is_ok() {
                        worker.run_job(job).await;
                    }
                }
                .instrument(span),
            );
            return Ok(());
        }

        if let Ok(permit) = Arc::clone(&self.overflow).try_acquire_owned() {
            workers.spawn(
                async move {
                    worker.run_job(job).await;
                    drop(permit);
                }
                .instrument(span),
            );
            return Ok(());
        }

        Err(PoolSaturated)
    }
}
