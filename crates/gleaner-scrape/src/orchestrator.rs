//! Multi-page scrape orchestration.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{FetchBackend, FetchConfig, Record, ScrapeError};

/// Maximum relative deviation applied to the wait between page fetches.
pub const JITTER_FRACTION: f64 = 0.2;

/// Limits applied when a run follows pagination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaginationPolicy {
    /// Stop once this many pages have been fetched.
    pub max_pages: Option<u32>,
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeResult {
    pub items: Vec<Record>,
    /// Root URL the run started from.
    pub url: String,
    /// Pages attempted, including one that failed.
    pub pages_scraped: u32,
    pub total_items: usize,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Drives a [`FetchBackend`] from the root URL until a stopping condition.
#[derive(Debug, Clone)]
pub struct ScrapeOrchestrator {
    url: String,
    pagination: Option<PaginationPolicy>,
    wait_time: Duration,
    jitter: bool,
}

impl ScrapeOrchestrator {
    /// Create a single-page orchestrator for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pagination: None,
            wait_time: Duration::ZERO,
            jitter: true,
        }
    }

    /// Build an orchestrator from a resolved configuration.
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            url: config.url.clone(),
            pagination: config.pagination.as_ref().map(|p| PaginationPolicy {
                max_pages: p.max_pages,
            }),
            wait_time: config.wait_duration(),
            jitter: true,
        }
    }

    pub fn with_pagination(mut self, policy: PaginationPolicy) -> Self {
        self.pagination = Some(policy);
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Disable the random deviation on the wait time.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Run to completion.
    ///
    /// Never fails: errors are captured in the returned [`ScrapeResult`]
    /// together with whatever was collected before them.
    #[tracing::instrument(skip(self, backend), fields(url = %self.url))]
    pub async fn run(&self, backend: &mut dyn FetchBackend) -> ScrapeResult {
        let started = Instant::now();
        let mut items = Vec::new();
        let mut pages = 0u32;

        let mut error = match backend.before().await {
            Ok(()) => self
                .paginate(backend, &mut items, &mut pages)
                .await
                .err()
                .map(|e| e.to_string()),
            Err(e) => {
                warn!(error = %e, "backend setup failed");
                Some(e.to_string())
            }
        };

        if let Err(e) = backend.after().await {
            warn!(error = %e, "backend cleanup failed");
            error.get_or_insert_with(|| e.to_string());
        }

        let duration = started.elapsed();
        match &error {
            None => info!(
                pages,
                items = items.len(),
                elapsed_ms = duration.as_millis() as u64,
                "scrape finished"
            ),
            Some(e) => warn!(pages, items = items.len(), error = %e, "scrape aborted"),
        }

        ScrapeResult {
            total_items: items.len(),
            items,
            url: self.url.clone(),
            pages_scraped: pages,
            success: error.is_none(),
            error,
            duration,
        }
    }

    async fn paginate(
        &self,
        backend: &mut dyn FetchBackend,
        items: &mut Vec<Record>,
        pages: &mut u32,
    ) -> Result<(), ScrapeError> {
        let mut current_url = self.url.clone();

        loop {
            let delay = self.delay();
            if !delay.is_zero() {
                debug!(delay_ms = delay.as_millis() as u64, "waiting before fetch");
                sleep(delay).await;
            }

            *pages += 1;
            debug!(page = *pages, url = %current_url, "fetching page");
            let page_items = backend.fetch_page(&current_url).await?;
            items.extend(page_items);

            if !self.should_continue(*pages) {
                debug!(page = *pages, "pagination limit reached");
                return Ok(());
            }

            match backend.next_page_url(&current_url, *pages).await? {
                Some(next) => current_url = next,
                None => {
                    debug!(page = *pages, "no next page");
                    return Ok(());
                }
            }
        }
    }

    fn should_continue(&self, pages: u32) -> bool {
        match self.pagination {
            None => false,
            Some(PaginationPolicy { max_pages }) => max_pages.is_none_or(|max| pages < max),
        }
    }

    fn delay(&self) -> Duration {
        if self.jitter {
            jittered(self.wait_time)
        } else {
            self.wait_time
        }
    }
}

/// `base` scaled by a uniform factor in `[1 - JITTER_FRACTION, 1 + JITTER_FRACTION]`.
pub fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor = rand::thread_rng().gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
    base.mul_f64(factor)
}
