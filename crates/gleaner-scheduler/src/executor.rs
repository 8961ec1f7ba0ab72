//! Scrape-backed job execution.

use std::sync::Arc;

use gleaner_scrape::{BackendFactory, ConfigResolver, ScrapeError, ScrapeOrchestrator, ScrapeResult};
use tracing::info;

use crate::{JobExecutor, JobFuture, JobRecord, SchedulerError};

/// Build the executor that runs a job's configuration through the scraper.
pub fn scrape_executor(
    resolver: Arc<dyn ConfigResolver>,
    factory: Arc<dyn BackendFactory>,
) -> JobExecutor {
    Arc::new(move |job: JobRecord| -> JobFuture {
        let resolver = Arc::clone(&resolver);
        let factory = Arc::clone(&factory);
        Box::pin(async move {
            run_scrape(&job, resolver.as_ref(), factory.as_ref())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    })
}

/// Resolve the job's configuration and scrape it once.
///
/// An unsuccessful run becomes [`SchedulerError::ScrapeFailed`]; the items
/// collected before the failure are discarded.
#[tracing::instrument(skip_all, fields(id = %job.id, config = %job.config_ref))]
pub async fn run_scrape(
    job: &JobRecord,
    resolver: &dyn ConfigResolver,
    factory: &dyn BackendFactory,
) -> Result<ScrapeResult, SchedulerError> {
    let config = resolver
        .resolve(&job.config_ref)
        .await
        .map_err(|e| match e {
            ScrapeError::ConfigNotFound(name) => SchedulerError::ConfigNotFound(name),
            other => SchedulerError::Scrape(other),
        })?;

    let mut backend = factory.create(&config).await?;
    let result = ScrapeOrchestrator::from_config(&config)
        .run(backend.as_mut())
        .await;

    if !result.success {
        let error = result.error.unwrap_or_else(|| "unknown error".to_string());
        return Err(SchedulerError::ScrapeFailed(error));
    }

    info!(
        pages = result.pages_scraped,
        items = result.total_items,
        "scrape succeeded"
    );
    Ok(result)
}
