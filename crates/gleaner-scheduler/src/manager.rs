//! Job lifecycle management.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use gleaner_scrape::ConfigResolver;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{JobPatch, JobRecord, JobStatus, JobStore, ScheduleRule, SchedulerError};

/// Owns the job records of one process and is its only writer of their state.
///
/// Each mutation updates the in-memory record and then persists it. When the
/// write fails the error is returned while the in-memory change stands, so
/// the two may differ until the record's next successful write.
pub struct JobManager {
    store: JobStore,
    resolver: Arc<dyn ConfigResolver>,
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl JobManager {
    /// Load all jobs from `store`.
    #[tracing::instrument(skip_all)]
    pub async fn open(
        store: JobStore,
        resolver: Arc<dyn ConfigResolver>,
    ) -> Result<Self, SchedulerError> {
        let jobs: HashMap<String, JobRecord> = store
            .load_all()
            .await?
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();

        info!(count = jobs.len(), "loaded jobs");
        Ok(Self {
            store,
            resolver,
            jobs: RwLock::new(jobs),
        })
    }

    /// Re-queue jobs left `Running` by a process that exited mid-run.
    ///
    /// Only the process that executes jobs may call this, before it starts
    /// dispatching: a `Running` record may belong to a live scheduler in
    /// another process. Returns the ids of the re-queued jobs.
    #[tracing::instrument(skip_all)]
    pub async fn recover_interrupted(&self) -> Result<Vec<String>, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let mut recovered = Vec::new();

        for job in jobs.values_mut() {
            if job.status != JobStatus::Running {
                continue;
            }
            warn!(id = %job.id, name = %job.name, "job was interrupted, re-queueing");
            job.set_status(JobStatus::Pending, Utc::now());
            self.store.save(job).await?;
            recovered.push(job.id.clone());
        }

        Ok(recovered)
    }

    /// Merge records written by other processes into memory.
    ///
    /// The stored copy wins for every job that is not `Running` here, and
    /// jobs whose record is gone are dropped. Jobs `Running` in this
    /// process keep their in-memory state until their run is booked.
    /// Returns the number of jobs added, replaced or dropped.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self) -> Result<usize, SchedulerError> {
        // Load under the write lock so no booking of ours lands in between.
        let mut jobs = self.jobs.write().await;
        let stored = self.store.load_all().await?;

        let mut changed = 0;
        let mut seen = HashSet::with_capacity(stored.len());
        for job in stored {
            seen.insert(job.id.clone());
            let keep = jobs
                .get(&job.id)
                .is_some_and(|current| current.status == JobStatus::Running || *current == job);
            if !keep {
                jobs.insert(job.id.clone(), job);
                changed += 1;
            }
        }

        let before = jobs.len();
        jobs.retain(|id, job| seen.contains(id) || job.status == JobStatus::Running);
        changed += before - jobs.len();

        if changed > 0 {
            debug!(changed, "refreshed jobs from store");
        }
        Ok(changed)
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<dyn ConfigResolver> {
        &self.resolver
    }

    /// Create and persist a job for the configuration named `config_ref`.
    #[tracing::instrument(skip(self, schedule))]
    pub async fn create_job(
        &self,
        name: &str,
        config_ref: &str,
        schedule: Option<ScheduleRule>,
    ) -> Result<JobRecord, SchedulerError> {
        self.ensure_config(config_ref).await?;

        let job = JobRecord::new(name, config_ref, schedule);
        let mut jobs = self.jobs.write().await;
        self.store.save(&job).await?;
        jobs.insert(job.id.clone(), job.clone());

        info!(id = %job.id, status = %job.status, next_run = ?job.next_run, "created job");
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Jobs matching every given filter, oldest first.
    pub async fn get_jobs(
        &self,
        status: Option<JobStatus>,
        config_ref: Option<&str>,
    ) -> Vec<JobRecord> {
        let mut matching: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .filter(|job| config_ref.is_none_or(|c| job.config_ref == c))
            .cloned()
            .collect();
        sort_oldest_first(&mut matching);
        matching
    }

    /// Apply the fields present in `patch`.
    #[tracing::instrument(skip(self, patch))]
    pub async fn update_job(
        &self,
        id: &str,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, SchedulerError> {
        if let Some(config_ref) = &patch.config_ref {
            self.ensure_config(config_ref).await?;
        }
        self.mutate(id, |job| {
            job.apply(patch, Utc::now());
            Ok(())
        })
        .await
    }

    /// Set the status of a job, bypassing the lifecycle checks.
    ///
    /// This is an administrative override: any status may follow any other.
    /// The scheduler and the CLI go through [`JobManager::mark_running`],
    /// [`JobManager::cancel_job`] and [`JobManager::run_now`] instead. Only
    /// the `next_run` rule still applies. Setting the current status again
    /// only refreshes `updated_at`.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
    ) -> Result<Option<JobRecord>, SchedulerError> {
        self.mutate(id, |job| {
            if job.status == status {
                job.updated_at = Utc::now();
            } else {
                debug!(from = %job.status, to = %status, "status change");
                job.set_status(status, Utc::now());
            }
            Ok(())
        })
        .await
    }

    /// Remove a job and its record. Returns `false` for an unknown id.
    #[tracing::instrument(skip(self))]
    pub async fn delete_job(&self, id: &str) -> Result<bool, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(id) {
            return Ok(false);
        }

        self.store.delete(id).await?;
        jobs.remove(id);
        info!("deleted job");
        Ok(true)
    }

    /// Claim a due job for execution by moving it to `Running`.
    ///
    /// Fails with [`SchedulerError::InvalidTransition`] when the job is no
    /// longer due, for example because it was cancelled since the poll.
    #[tracing::instrument(skip(self))]
    pub async fn mark_running(&self, id: &str) -> Result<Option<JobRecord>, SchedulerError> {
        self.mutate(id, |job| {
            let now = Utc::now();
            if job.is_due(now) {
                job.set_status(JobStatus::Running, now);
                Ok(())
            } else {
                Err(SchedulerError::InvalidTransition {
                    id: job.id.clone(),
                    from: job.status,
                    to: JobStatus::Running,
                })
            }
        })
        .await
    }

    /// Book a successful run.
    ///
    /// A scheduled job with runs left goes back to `Scheduled` for its next
    /// occurrence; anything else ends `Completed`.
    #[tracing::instrument(skip(self))]
    pub async fn mark_completed(&self, id: &str) -> Result<Option<JobRecord>, SchedulerError> {
        self.mutate(id, |job| {
            job.record_success(Utc::now());
            match job.next_run {
                Some(next) => info!(run_count = job.run_count, %next, "job rescheduled"),
                None => info!(run_count = job.run_count, "job completed"),
            }
            Ok(())
        })
        .await
    }

    /// Book a failed run; the job retries on the next poll while attempts remain.
    #[tracing::instrument(skip(self, error_message))]
    pub async fn mark_failed(
        &self,
        id: &str,
        error_message: &str,
    ) -> Result<Option<JobRecord>, SchedulerError> {
        self.mutate(id, |job| {
            job.record_failure(error_message, Utc::now());
            if job.status == JobStatus::Failed {
                warn!(
                    retries = job.retries,
                    error = %error_message,
                    "job failed, no retries left"
                );
            } else {
                warn!(
                    retries = job.retries,
                    max_retries = job.max_retries,
                    error = %error_message,
                    "job failed, will retry"
                );
            }
            Ok(())
        })
        .await
    }

    /// Jobs due for dispatch now, oldest first.
    pub async fn get_pending_jobs(&self) -> Vec<JobRecord> {
        let now = Utc::now();
        let mut due: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect();
        sort_oldest_first(&mut due);
        due
    }

    /// Withdraw a pending or scheduled job.
    ///
    /// A running job cannot be cancelled; it finishes on its own.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_job(&self, id: &str) -> Result<Option<JobRecord>, SchedulerError> {
        self.mutate(id, |job| match job.status {
            JobStatus::Pending | JobStatus::Scheduled => {
                job.set_status(JobStatus::Cancelled, Utc::now());
                info!("cancelled job");
                Ok(())
            }
            from => Err(SchedulerError::InvalidTransition {
                id: job.id.clone(),
                from,
                to: JobStatus::Cancelled,
            }),
        })
        .await
    }

    /// Queue a job for the next poll, whatever its state, unless it is running.
    #[tracing::instrument(skip(self))]
    pub async fn run_now(&self, id: &str) -> Result<Option<JobRecord>, SchedulerError> {
        self.mutate(id, |job| match job.status {
            JobStatus::Running => Err(SchedulerError::InvalidTransition {
                id: job.id.clone(),
                from: JobStatus::Running,
                to: JobStatus::Pending,
            }),
            _ => {
                job.set_status(JobStatus::Pending, Utc::now());
                info!("job queued to run now");
                Ok(())
            }
        })
        .await
    }

    /// Apply `f` to the job under the write lock and persist the result.
    ///
    /// `f` works on a copy; an error from it leaves the job untouched.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<Option<JobRecord>, SchedulerError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), SchedulerError>,
    {
        let mut jobs = self.jobs.write().await;
        let Some(current) = jobs.get(id) else {
            return Ok(None);
        };

        let mut updated = current.clone();
        f(&mut updated)?;
        jobs.insert(id.to_string(), updated.clone());

        self.store.save(&updated).await?;
        Ok(Some(updated))
    }

    async fn ensure_config(&self, config_ref: &str) -> Result<(), SchedulerError> {
        if self.resolver.contains(config_ref).await {
            Ok(())
        } else {
            Err(SchedulerError::ConfigNotFound(config_ref.to_string()))
        }
    }
}

fn sort_oldest_first(jobs: &mut [JobRecord]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gleaner_scrape::{FetchConfig, StaticConfigResolver};
    use pretty_assertions::assert_eq;
    use tempfile::{TempDir, tempdir};

    const CONFIG: &str = "products";

    async fn manager_in(dir: &TempDir) -> JobManager {
        let store = JobStore::open(dir.path()).await.unwrap();
        let resolver = StaticConfigResolver::new().with_config(
            CONFIG,
            FetchConfig::new("https://shop.example.com").with_selector("name", "h2"),
        );
        JobManager::open(store, Arc::new(resolver)).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_without_schedule() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;

        let job = manager.create_job("Adhoc", CONFIG, None).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_run, None);
        assert_eq!(manager.get_job(&job.id).await, Some(job.clone()));
        assert!(manager.store().path_for(&job.id).exists());
    }

    #[tokio::test]
    async fn test_create_with_schedule() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;

        let start = Utc::now() + Duration::hours(2);
        let rule = ScheduleRule::daily(start, 1).unwrap();
        let job = manager.create_job("Daily", CONFIG, Some(rule)).await.unwrap();

        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.next_run, Some(start));
    }

    #[tokio::test]
    async fn test_create_with_unknown_config() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;

        let result = manager.create_job("Lost", "missing", None).await;
        assert!(matches!(result, Err(SchedulerError::ConfigNotFound(name)) if name == "missing"));
        assert!(manager.get_jobs(None, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_get_jobs_filters() {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();
        let resolver = StaticConfigResolver::new()
            .with_config("a", FetchConfig::new("https://a.example.com").with_selector("t", "h1"))
            .with_config("b", FetchConfig::new("https://b.example.com").with_selector("t", "h1"));
        let manager = JobManager::open(store, Arc::new(resolver)).await.unwrap();

        let later = Some(ScheduleRule::once(Utc::now() + Duration::days(1)));
        let a1 = manager.create_job("a1", "a", None).await.unwrap();
        let a2 = manager.create_job("a2", "a", later.clone()).await.unwrap();
        let b1 = manager.create_job("b1", "b", later).await.unwrap();

        assert_eq!(manager.get_jobs(None, None).await.len(), 3);
        assert_eq!(manager.get_jobs(None, Some("a")).await, vec![a1.clone(), a2.clone()]);
        assert_eq!(
            manager.get_jobs(Some(JobStatus::Scheduled), None).await,
            vec![a2.clone(), b1]
        );
        assert_eq!(
            manager.get_jobs(Some(JobStatus::Scheduled), Some("a")).await,
            vec![a2]
        );
        assert!(manager.get_jobs(Some(JobStatus::Failed), None).await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_jobs() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;

        let pending = manager.create_job("now", CONFIG, None).await.unwrap();
        let past = Some(ScheduleRule::once(Utc::now() - Duration::minutes(5)));
        let overdue = manager.create_job("overdue", CONFIG, past).await.unwrap();
        let future = Some(ScheduleRule::once(Utc::now() + Duration::hours(1)));
        manager.create_job("future", CONFIG, future).await.unwrap();
        let running = manager.create_job("running", CONFIG, None).await.unwrap();
        manager
            .update_status(&running.id, JobStatus::Running)
            .await
            .unwrap();
        let cancelled = manager.create_job("cancelled", CONFIG, None).await.unwrap();
        manager.cancel_job(&cancelled.id).await.unwrap();

        let due: Vec<String> = manager
            .get_pending_jobs()
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(due, vec![pending.id, overdue.id]);
    }

    #[tokio::test]
    async fn test_update_job_patch() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Old", CONFIG, None).await.unwrap();

        let updated = manager
            .update_job(
                &job.id,
                JobPatch {
                    name: Some("New".to_string()),
                    max_runs: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.name, "New");
        assert_eq!(updated.max_runs, Some(3));
        assert_eq!(updated.config_ref, CONFIG);
        assert!(updated.updated_at >= job.updated_at);

        let patch = JobPatch {
            config_ref: Some("missing".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            manager.update_job(&job.id, patch).await,
            Err(SchedulerError::ConfigNotFound(_))
        ));
        assert_eq!(
            manager.update_job("nope", JobPatch::default()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_update_status_same_status_refreshes_timestamp() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Same", CONFIG, None).await.unwrap();

        let updated = manager
            .update_status(&job.id, JobStatus::Pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, JobStatus::Pending);
        assert!(updated.updated_at >= job.updated_at);
        assert_eq!(
            manager.update_status("nope", JobStatus::Pending).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_delete_job() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Gone", CONFIG, None).await.unwrap();

        assert!(manager.delete_job(&job.id).await.unwrap());
        assert_eq!(manager.get_job(&job.id).await, None);
        assert!(!manager.store().path_for(&job.id).exists());
        assert!(!manager.delete_job(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_failed_until_terminal() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Flaky", CONFIG, None).await.unwrap();

        for expected in 1..=2 {
            let job = manager.mark_failed(&job.id, "timeout").await.unwrap().unwrap();
            assert_eq!(job.retries, expected);
            assert_eq!(job.status, JobStatus::Scheduled);
        }
        assert_eq!(manager.get_pending_jobs().await.len(), 1);

        let failed = manager.mark_failed(&job.id, "refused").await.unwrap().unwrap();
        assert_eq!(failed.retries, 3);
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("refused"));
        assert!(manager.get_pending_jobs().await.is_empty());

        let again = manager.mark_failed(&job.id, "still").await.unwrap().unwrap();
        assert_eq!(again.retries, 4);
        assert_eq!(again.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_once_job_not_due_after_completion() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let rule = ScheduleRule::once(Utc::now() - Duration::minutes(1));
        let job = manager.create_job("Once", CONFIG, Some(rule)).await.unwrap();

        let done = manager.mark_completed(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.next_run, None);
        assert_eq!(done.run_count, 1);
        assert!(manager.get_pending_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_daily_job_rescheduled_after_completion() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let t0 = Utc::now() - Duration::minutes(1);
        let rule = ScheduleRule::daily(t0, 1).unwrap();
        let job = manager.create_job("Daily", CONFIG, Some(rule)).await.unwrap();

        let done = manager.mark_completed(&job.id).await.unwrap().unwrap();
        let last_run = done.last_run.unwrap();
        assert!(last_run >= t0);
        assert_eq!(done.run_count, 1);
        assert_eq!(done.status, JobStatus::Scheduled);
        assert_eq!(done.next_run, Some(last_run + Duration::days(1)));
        assert!(manager.get_pending_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_mark_running_requires_due_job() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let due = manager.create_job("Due", CONFIG, None).await.unwrap();
        let later = Some(ScheduleRule::once(Utc::now() + Duration::hours(1)));
        let not_due = manager.create_job("Later", CONFIG, later).await.unwrap();

        let running = manager.mark_running(&due.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.next_run, None);

        assert!(matches!(
            manager.mark_running(&due.id).await,
            Err(SchedulerError::InvalidTransition {
                from: JobStatus::Running,
                ..
            })
        ));
        assert!(manager.mark_running(&not_due.id).await.is_err());
        assert_eq!(manager.mark_running("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Stop", CONFIG, None).await.unwrap();

        let cancelled = manager.cancel_job(&job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let result = manager.cancel_job(&job.id).await;
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidTransition {
                from: JobStatus::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_job_refused() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Busy", CONFIG, None).await.unwrap();
        manager
            .update_status(&job.id, JobStatus::Running)
            .await
            .unwrap();

        assert!(manager.cancel_job(&job.id).await.is_err());
        assert_eq!(
            manager.get_job(&job.id).await.unwrap().status,
            JobStatus::Running
        );
        assert!(manager.run_now(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_run_now_requeues_terminal_job() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Again", CONFIG, None).await.unwrap();
        manager.cancel_job(&job.id).await.unwrap();

        let queued = manager.run_now(&job.id).await.unwrap().unwrap();
        assert_eq!(queued.status, JobStatus::Pending);
        assert_eq!(queued.next_run, None);
        assert_eq!(manager.get_pending_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_overrides_lifecycle() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let rule = ScheduleRule::once(Utc::now() - Duration::minutes(1));
        let job = manager.create_job("Forced", CONFIG, Some(rule)).await.unwrap();
        manager.mark_completed(&job.id).await.unwrap();

        let forced = manager
            .update_status(&job.id, JobStatus::Running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forced.status, JobStatus::Running);
        assert_eq!(forced.next_run, None);

        let rescheduled = manager
            .update_status(&job.id, JobStatus::Scheduled)
            .await
            .unwrap()
            .unwrap();
        assert!(rescheduled.next_run.is_some());
    }

    #[tokio::test]
    async fn test_reopen_restores_state_and_recovers_running() {
        let dir = tempdir().unwrap();
        let (kept, interrupted) = {
            let manager = manager_in(&dir).await;
            let rule = ScheduleRule::weekly(Utc::now() + Duration::days(1), 1).unwrap();
            let kept = manager.create_job("Kept", CONFIG, Some(rule)).await.unwrap();
            let busy = manager.create_job("Busy", CONFIG, None).await.unwrap();
            manager
                .update_status(&busy.id, JobStatus::Running)
                .await
                .unwrap();
            (kept, busy)
        };

        let manager = manager_in(&dir).await;
        assert_eq!(manager.get_job(&kept.id).await, Some(kept));
        // Opening alone leaves another process's running job alone.
        assert_eq!(
            manager.get_job(&interrupted.id).await.unwrap().status,
            JobStatus::Running
        );

        let recovered = manager.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![interrupted.id.clone()]);

        let requeued = manager.get_job(&interrupted.id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);

        let on_disk = manager.store().load_all().await.unwrap();
        let persisted = on_disk.iter().find(|j| j.id == interrupted.id).unwrap();
        assert_eq!(persisted.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_refresh_sees_changes_from_another_manager() {
        let dir = tempdir().unwrap();
        let daemon = manager_in(&dir).await;
        let flaky = daemon.create_job("Flaky", CONFIG, None).await.unwrap();
        daemon.mark_running(&flaky.id).await.unwrap();
        daemon.mark_failed(&flaky.id, "timeout").await.unwrap();

        let cli = manager_in(&dir).await;
        cli.cancel_job(&flaky.id).await.unwrap();
        let fresh = cli.create_job("Fresh", CONFIG, None).await.unwrap();

        assert_eq!(daemon.refresh().await.unwrap(), 2);
        let due: Vec<String> = daemon
            .get_pending_jobs()
            .await
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(due, vec![fresh.id.clone()]);
        assert_eq!(
            daemon.get_job(&flaky.id).await.unwrap().status,
            JobStatus::Cancelled
        );

        cli.delete_job(&fresh.id).await.unwrap();
        assert_eq!(daemon.refresh().await.unwrap(), 1);
        assert_eq!(daemon.get_job(&fresh.id).await, None);
        assert_eq!(daemon.refresh().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_keeps_running_jobs() {
        let dir = tempdir().unwrap();
        let daemon = manager_in(&dir).await;
        let busy = daemon.create_job("Busy", CONFIG, None).await.unwrap();
        daemon.mark_running(&busy.id).await.unwrap();

        // Another process rewrites the record while the run is in flight.
        let mut stale = daemon.get_job(&busy.id).await.unwrap();
        stale.set_status(JobStatus::Pending, Utc::now());
        daemon.store().save(&stale).await.unwrap();

        assert_eq!(daemon.refresh().await.unwrap(), 0);
        assert_eq!(
            daemon.get_job(&busy.id).await.unwrap().status,
            JobStatus::Running
        );

        let done = daemon.mark_completed(&busy.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let on_disk = daemon.store().load_all().await.unwrap();
        assert_eq!(on_disk, vec![done]);
    }

    /// A manager whose store lives in `<dir>/jobs`.
    async fn manager_in_subdir(dir: &TempDir) -> JobManager {
        let store = JobStore::open(dir.path().join("jobs")).await.unwrap();
        let resolver = StaticConfigResolver::new().with_config(
            CONFIG,
            FetchConfig::new("https://shop.example.com").with_selector("name", "h2"),
        );
        JobManager::open(store, Arc::new(resolver)).await.unwrap()
    }

    /// Put a directory where the record of `id` belongs so writes to it fail.
    fn block_record(manager: &JobManager, id: &str) {
        let path = manager.store().path_for(id);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_is_reported_and_change_stands() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Stuck", CONFIG, None).await.unwrap();
        block_record(&manager, &job.id);

        let result = manager.mark_failed(&job.id, "timeout").await;
        assert!(matches!(result, Err(SchedulerError::Persistence { ref id, .. }) if *id == job.id));

        let in_memory = manager.get_job(&job.id).await.unwrap();
        assert_eq!(in_memory.retries, 1);
        assert_eq!(in_memory.error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_job() {
        let dir = tempdir().unwrap();
        let manager = manager_in_subdir(&dir).await;
        let jobs = dir.path().join("jobs");
        std::fs::remove_dir(&jobs).unwrap();
        std::fs::write(&jobs, "not a directory").unwrap();

        let result = manager.create_job("Nowhere", CONFIG, None).await;
        assert!(matches!(result, Err(SchedulerError::Persistence { .. })));
        assert!(manager.get_jobs(None, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_job() {
        let dir = tempdir().unwrap();
        let manager = manager_in(&dir).await;
        let job = manager.create_job("Sticky", CONFIG, None).await.unwrap();
        block_record(&manager, &job.id);

        let result = manager.delete_job(&job.id).await;
        assert!(matches!(result, Err(SchedulerError::Persistence { .. })));
        assert_eq!(manager.get_job(&job.id).await, Some(job));
    }
}
