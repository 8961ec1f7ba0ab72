//! Error types for the scheduler.

use thiserror::Error;

use crate::JobStatus;

/// Errors that can occur in job management and scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job references a configuration that cannot be resolved.
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),

    /// A schedule rule or job field is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The requested status change is not allowed from the current status.
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// Reading or writing a job record failed.
    #[error("persistence error for job {id}: {source}")]
    Persistence {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// A job record could not be serialized.
    #[error("serialization error for job {id}: {source}")]
    Serialization {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem error outside a single record.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resolving or fetching for a job run failed.
    #[error(transparent)]
    Scrape(#[from] gleaner_scrape::ScrapeError),

    /// A scrape run finished unsuccessfully.
    #[error("scraping failed: {0}")]
    ScrapeFailed(String),
}
