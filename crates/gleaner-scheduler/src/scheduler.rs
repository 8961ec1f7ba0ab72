//! Polling job scheduler.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::{JobManager, JobRecord, JobStatus, SchedulerError};

/// Future returned by a [`JobExecutor`].
pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Runs one job; an `Err` carries the failure message recorded on the job.
pub type JobExecutor = Arc<dyn Fn(JobRecord) -> JobFuture + Send + Sync>;

/// Called with the updated record after a successful run.
pub type CompletedCallback = Arc<dyn Fn(&JobRecord) + Send + Sync>;

/// Called with the updated record and the error message after a failed run.
pub type FailedCallback = Arc<dyn Fn(&JobRecord, &str) + Send + Sync>;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between polls for due jobs.
    pub check_interval: Duration,
    /// Executions allowed in flight at once. Due jobs beyond this wait for
    /// a later poll.
    pub max_concurrent_jobs: usize,
    /// How long [`Scheduler::stop`] waits for the poll loop to exit.
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            max_concurrent_jobs: 4,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Background scheduler that polls a [`JobManager`] and dispatches due jobs.
///
/// The poll loop is one tokio task and each execution another. Executions
/// already dispatched are never interrupted by [`Scheduler::stop`].
pub struct Scheduler {
    shared: Arc<Shared>,
    poll_loop: Mutex<Option<PollLoop>>,
}

struct PollLoop {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    manager: Arc<JobManager>,
    executor: JobExecutor,
    config: SchedulerConfig,
    capacity: usize,
    /// Ids of jobs currently executing.
    running: DashSet<String>,
    permits: Arc<Semaphore>,
    completed_callbacks: RwLock<Vec<CompletedCallback>>,
    failed_callbacks: RwLock<Vec<FailedCallback>>,
}

/// Removes a job from the running set when its execution task ends.
struct RunningGuard {
    shared: Arc<Shared>,
    id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.shared.running.remove(&self.id);
    }
}

impl Scheduler {
    /// Create a stopped scheduler.
    pub fn new(manager: Arc<JobManager>, executor: JobExecutor, config: SchedulerConfig) -> Self {
        let capacity = config.max_concurrent_jobs.max(1);
        Self {
            shared: Arc::new(Shared {
                manager,
                executor,
                capacity,
                config,
                running: DashSet::new(),
                permits: Arc::new(Semaphore::new(capacity)),
                completed_callbacks: RwLock::new(Vec::new()),
                failed_callbacks: RwLock::new(Vec::new()),
            }),
            poll_loop: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.shared.manager
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Launch the poll loop. Must be called from within a tokio runtime.
    ///
    /// Does nothing if the loop is already running.
    pub fn start(&self) {
        let mut poll_loop = self.poll_loop.lock().unwrap_or_else(PoisonError::into_inner);
        if poll_loop.as_ref().is_some_and(|l| !l.task.is_finished()) {
            warn!("scheduler is already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(Arc::clone(&self.shared), shutdown_rx));
        *poll_loop = Some(PollLoop { shutdown_tx, task });
    }

    /// Signal the poll loop to exit and wait up to the configured timeout.
    ///
    /// Does nothing if the loop is not running.
    pub async fn stop(&self) {
        let poll_loop = self
            .poll_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .filter(|l| !l.task.is_finished());
        let Some(PollLoop {
            shutdown_tx,
            mut task,
        }) = poll_loop
        else {
            warn!("scheduler is not running");
            return;
        };

        let _ = shutdown_tx.send(true);
        match timeout(self.shared.config.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "scheduler loop ended abnormally"),
            Err(_) => {
                warn!(
                    timeout_ms = self.shared.config.stop_timeout.as_millis() as u64,
                    "scheduler loop did not stop in time, aborting it"
                );
                task.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.poll_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }

    /// Register a callback for successful runs. Callbacks run in registration order.
    pub fn add_completed_callback<F>(&self, callback: F)
    where
        F: Fn(&JobRecord) + Send + Sync + 'static,
    {
        self.shared
            .completed_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Register a callback for failed runs. Callbacks run in registration order.
    pub fn add_failed_callback<F>(&self, callback: F)
    where
        F: Fn(&JobRecord, &str) + Send + Sync + 'static,
    {
        self.shared
            .failed_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Ids of jobs currently executing.
    pub fn running_jobs(&self) -> Vec<String> {
        self.shared.running.iter().map(|id| id.key().clone()).collect()
    }

    pub fn is_job_running(&self, id: &str) -> bool {
        self.shared.running.contains(id)
    }

    /// Run a single poll. Returns the number of jobs dispatched.
    pub async fn poll_once(&self) -> usize {
        Arc::clone(&self.shared).tick().await
    }

    /// Wait until no execution is in flight.
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.shared.capacity).unwrap_or(u32::MAX);
        // Executions hold a permit until they have left the running set.
        drop(self.shared.permits.acquire_many(all).await);
    }
}

async fn run_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    info!(
        check_interval_secs = shared.config.check_interval.as_secs(),
        max_concurrent_jobs = shared.capacity,
        "scheduler started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // A panicking tick must not take the loop down with it.
        match tokio::spawn(Arc::clone(&shared).tick()).await {
            Ok(0) => {}
            Ok(dispatched) => debug!(dispatched, "dispatched jobs"),
            Err(e) => error!(error = %e, "scheduler tick failed"),
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep(shared.config.check_interval) => {}
        }
    }

    info!("scheduler stopped");
}

impl Shared {
    async fn tick(self: Arc<Self>) -> usize {
        // Pick up jobs created, cancelled or re-queued by other processes.
        if let Err(e) = self.manager.refresh().await {
            warn!(error = %e, "failed to refresh jobs from store");
        }

        let due = self.manager.get_pending_jobs().await;
        if due.is_empty() {
            return 0;
        }
        debug!(count = due.len(), "found due jobs");

        let mut dispatched = 0;
        for (index, job) in due.iter().enumerate() {
            if self.running.contains(&job.id) {
                debug!(id = %job.id, "job already running, skipping");
                continue;
            }

            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                info!(
                    deferred = due.len() - index,
                    limit = self.capacity,
                    "concurrency limit reached, deferring to next poll"
                );
                break;
            };

            let job = match self.manager.mark_running(&job.id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(id = %job.id, "job deleted before dispatch");
                    continue;
                }
                Err(SchedulerError::InvalidTransition { from, .. }) => {
                    debug!(id = %job.id, status = %from, "job no longer due");
                    continue;
                }
                Err(e) => {
                    error!(id = %job.id, error = %e, "failed to persist running status");
                    match self.manager.get_job(&job.id).await {
                        Some(job) if job.status == JobStatus::Running => job,
                        _ => continue,
                    }
                }
            };

            if !self.running.insert(job.id.clone()) {
                continue;
            }
            let guard = RunningGuard {
                shared: Arc::clone(&self),
                id: job.id.clone(),
            };

            let shared = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                let _running = guard;
                shared.execute(job).await;
            });
            dispatched += 1;
        }

        dispatched
    }

    #[tracing::instrument(skip_all, fields(id = %job.id, name = %job.name))]
    async fn execute(&self, job: JobRecord) {
        info!("executing job");
        let id = job.id.clone();

        // The executor is called inside the task so a panic while building
        // the future is caught like one raised while polling it.
        let executor = Arc::clone(&self.executor);
        let outcome = match tokio::spawn(async move { executor(job).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(format!(
                "job execution panicked: {}",
                panic_message(&*e.into_panic())
            )),
            Err(e) => Err(format!("job execution was cancelled: {e}")),
        };

        match outcome {
            Ok(()) => self.finish_success(&id).await,
            Err(message) => self.finish_failure(&id, &message).await,
        }
    }

    async fn finish_success(&self, id: &str) {
        let job = match self.manager.mark_completed(id).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "failed to persist completion");
                self.manager.get_job(id).await
            }
        };
        let Some(job) = job else {
            warn!("job deleted during execution");
            return;
        };

        let callbacks = self
            .completed_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&job))) {
                error!(panic = %panic_message(&*panic), "completed callback panicked");
            }
        }
    }

    async fn finish_failure(&self, id: &str, message: &str) {
        let job = match self.manager.mark_failed(id, message).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "failed to persist failure");
                self.manager.get_job(id).await
            }
        };
        let Some(job) = job else {
            warn!("job deleted during execution");
            return;
        };

        let callbacks = self
            .failed_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&job, message))) {
                error!(panic = %panic_message(&*panic), "failed callback panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
