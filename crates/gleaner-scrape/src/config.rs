//! Fetch configuration model.
//!
//! A [`FetchConfig`] describes everything a single job run needs to know:
//! the root URL, which fields to extract, which backend to use and how to
//! walk from one page to the next.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ScrapeError;

/// Browser-like user agent applied when the configuration sets none.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

fn default_wait_time() -> f64 {
    0.5
}

/// Which fetch backend a configuration asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Let the backend selector decide from the page content.
    #[default]
    Auto,
    /// Plain HTTP fetch with static HTML parsing.
    Http,
    /// Headless-browser rendering.
    Browser,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Auto => "auto",
            BackendKind::Http => "http",
            BackendKind::Browser => "browser",
        };
        f.write_str(name)
    }
}

/// How the next page is located.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationType {
    #[default]
    None,
    /// Increment a query parameter (`?page=2`).
    UrlParam,
    /// Follow the link behind a "next" element.
    NextButton,
    /// Click a "load more" control (browser backends only).
    LoadMore,
    /// Scroll to trigger loading (browser backends only).
    InfiniteScroll,
}

/// Pagination settings for a configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(rename = "type", default)]
    pub kind: PaginationType,
    /// CSS selector of the pagination control.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Query parameter carrying the page number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_name: Option<String>,
    /// Upper bound on pages fetched per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

/// Output format requested by a configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
    Excel,
}

/// Where extracted records should be written.
///
/// Writing is handled outside this crate; the settings are carried so a
/// round-tripped configuration loses nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    pub path: String,
    #[serde(default)]
    pub append: bool,
}

/// Configuration for one scrape target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Root URL of the run.
    pub url: String,
    /// Field name to CSS selector.
    pub selectors: BTreeMap<String, String>,
    #[serde(default)]
    pub backend: BackendKind,
    /// Seconds to wait before each page fetch.
    #[serde(default = "default_wait_time")]
    pub wait_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputConfig>,
}

impl FetchConfig {
    /// Create a single-page configuration for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            selectors: BTreeMap::new(),
            backend: BackendKind::Auto,
            wait_time: default_wait_time(),
            user_agent: None,
            headers: BTreeMap::new(),
            pagination: None,
            output: None,
        }
    }

    /// Add a field selector.
    pub fn with_selector(mut self, field: impl Into<String>, selector: impl Into<String>) -> Self {
        self.selectors.insert(field.into(), selector.into());
        self
    }

    /// Set the pagination settings.
    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(source: &str) -> Result<Self, ScrapeError> {
        let config: FetchConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ScrapeError::InvalidConfig(format!(
                "url must start with http:// or https://, got '{}'",
                self.url
            )));
        }

        if self.selectors.is_empty() {
            return Err(ScrapeError::InvalidConfig(
                "at least one selector is required".to_string(),
            ));
        }

        if !self.wait_time.is_finite() || self.wait_time < 0.0 {
            return Err(ScrapeError::InvalidConfig(format!(
                "wait_time must be a non-negative number of seconds, got {}",
                self.wait_time
            )));
        }

        if let Some(pagination) = &self.pagination {
            let missing_selector = pagination.selector.as_deref().is_none_or(str::is_empty);
            match pagination.kind {
                PaginationType::NextButton | PaginationType::LoadMore if missing_selector => {
                    return Err(ScrapeError::InvalidConfig(format!(
                        "selector is required for {:?} pagination",
                        pagination.kind
                    )));
                }
                PaginationType::UrlParam
                    if pagination.param_name.as_deref().is_none_or(str::is_empty) =>
                {
                    return Err(ScrapeError::InvalidConfig(
                        "param_name is required for url_param pagination".to_string(),
                    ));
                }
                _ => {}
            }

            if pagination.max_pages == Some(0) {
                return Err(ScrapeError::InvalidConfig(
                    "max_pages must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Delay before each page fetch.
    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs_f64(self.wait_time.max(0.0))
    }

    /// Request headers with browser-like defaults filled in.
    ///
    /// An explicit `user_agent` wins over a `User-Agent` entry in `headers`.
    pub fn effective_headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        let has = |headers: &BTreeMap<String, String>, name: &str| {
            headers.keys().any(|k| k.eq_ignore_ascii_case(name))
        };

        if let Some(agent) = &self.user_agent {
            headers.retain(|k, _| !k.eq_ignore_ascii_case("user-agent"));
            headers.insert("User-Agent".to_string(), agent.clone());
        } else if !has(&headers, "user-agent") {
            headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());
            if !has(&headers, "accept") {
                headers.insert("Accept".to_string(), DEFAULT_ACCEPT.to_string());
            }
            if !has(&headers, "accept-language") {
                headers.insert(
                    "Accept-Language".to_string(),
                    DEFAULT_ACCEPT_LANGUAGE.to_string(),
                );
            }
        }

        headers
    }
}
