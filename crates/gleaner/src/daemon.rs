//! Foreground scheduler command.
//!
//! Runs the poll loop until Ctrl-C, then stops dispatching and waits for
//! in-flight scrapes to finish. A second Ctrl-C exits without waiting.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::{info, warn};

use gleaner_scheduler::{JobManager, Scheduler, SchedulerConfig, scrape_executor};
use gleaner_scrape::DefaultBackendFactory;

pub async fn run(
    manager: Arc<JobManager>,
    check_interval: u64,
    max_concurrent_jobs: usize,
) -> Result<()> {
    if check_interval == 0 {
        return Err(miette::miette!("--check-interval must be at least 1 second"));
    }
    if max_concurrent_jobs == 0 {
        return Err(miette::miette!("--max-concurrent-jobs must be at least 1"));
    }

    // Runs left behind by a previous scheduler that died mid-scrape.
    let recovered = manager
        .recover_interrupted()
        .await
        .map_err(|e| miette::miette!("failed to recover interrupted jobs: {}", e))?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "re-queued interrupted jobs");
    }

    let executor = scrape_executor(
        Arc::clone(manager.resolver()),
        Arc::new(DefaultBackendFactory::new()),
    );
    let config = SchedulerConfig {
        check_interval: Duration::from_secs(check_interval),
        max_concurrent_jobs,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(manager, executor, config);

    scheduler.add_completed_callback(|job| {
        info!(
            id = %job.id,
            name = %job.name,
            status = %job.status,
            runs = job.run_count,
            next_run = ?job.next_run,
            "job run completed"
        );
    });
    scheduler.add_failed_callback(|job, error| {
        warn!(
            id = %job.id,
            name = %job.name,
            status = %job.status,
            retries = job.retries,
            max_retries = job.max_retries,
            error = %error,
            "job run failed"
        );
    });

    scheduler.start();
    info!(
        jobs_dir = %scheduler.manager().store().dir().display(),
        "scheduler running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await.ok();
    info!("received shutdown signal");
    scheduler.stop().await;

    let running = scheduler.running_jobs();
    if !running.is_empty() {
        info!(
            count = running.len(),
            "waiting for running jobs, press Ctrl-C again to exit now"
        );
        tokio::select! {
            _ = scheduler.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => {
                // Interrupted jobs stay Running on disk and are re-queued on next start.
                warn!(jobs = ?scheduler.running_jobs(), "exiting with jobs still running");
            }
        }
    }

    info!("scheduler stopped");
    Ok(())
}
