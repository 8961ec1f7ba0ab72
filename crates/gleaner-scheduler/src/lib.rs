//! Durable job scheduling for Gleaner.
//!
//! This crate provides:
//! - Job records with one-shot, periodic and cron schedules
//! - A one-file-per-job store that survives crashes and restarts
//! - [`JobManager`], the single owner of job state transitions
//! - [`Scheduler`], a polling loop with bounded concurrent dispatch
//! - Bounded retries of failed runs

mod error;
mod executor;
mod manager;
mod scheduler;
mod store;
mod types;

pub use error::SchedulerError;
pub use executor::{run_scrape, scrape_executor};
pub use manager::JobManager;
pub use scheduler::{
    CompletedCallback, FailedCallback, JobExecutor, JobFuture, Scheduler, SchedulerConfig,
};
pub use store::JobStore;
pub use types::{
    DEFAULT_MAX_RETRIES, JobPatch, JobPriority, JobRecord, JobStatus, ScheduleRule, ScheduleType,
    parse_cron,
};
