//! Error types for scrape runs and configuration loading.

use thiserror::Error;

use crate::BackendKind;

/// Errors that can occur while resolving configuration or fetching pages.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// No configuration exists under the given name.
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),

    /// The configuration was found but is malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A page fetch or navigation failed.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A URL could not be parsed or joined.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// YAML parsing failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No backend of the requested kind is registered.
    #[error("backend not available: {0}")]
    UnsupportedBackend(BackendKind),
}
