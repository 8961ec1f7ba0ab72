//! The fetch capability driven by the orchestrator.

use async_trait::async_trait;

use crate::ScrapeError;

/// One extracted item: field name to value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A source of pages for one job run.
///
/// The orchestrator calls `before` once, then alternates `fetch_page` and
/// `next_page_url` strictly in sequence, and finally calls `after` once on
/// every exit path.
#[async_trait]
pub trait FetchBackend: Send {
    /// Open whatever session the backend needs.
    async fn before(&mut self) -> Result<(), ScrapeError> {
        Ok(())
    }

    /// Fetch `url` and return the records extracted from it.
    async fn fetch_page(&mut self, url: &str) -> Result<Vec<Record>, ScrapeError>;

    /// URL of the page after `current_url`, or `None` when there is none.
    ///
    /// `page_index` is the 1-based number of the page just fetched.
    async fn next_page_url(
        &mut self,
        current_url: &str,
        page_index: u32,
    ) -> Result<Option<String>, ScrapeError>;

    /// Release the session opened by `before`.
    async fn after(&mut self) -> Result<(), ScrapeError> {
        Ok(())
    }
}
