//! Paginated scraping for Gleaner.
//!
//! This crate provides:
//! - The [`FetchConfig`] model and resolvers that load it by name
//! - The [`FetchBackend`] capability and an HTTP implementation
//! - [`ScrapeOrchestrator`], which drives one run page by page
//! - Pluggable backend selection for `auto` configurations

mod backend;
mod config;
mod error;
mod http;
mod orchestrator;
pub mod pagination;
mod resolver;
mod select;

pub use backend::{FetchBackend, Record};
pub use config::{
    BackendKind, DEFAULT_USER_AGENT, FetchConfig, OutputConfig, OutputFormat, PaginationConfig,
    PaginationType,
};
pub use error::ScrapeError;
pub use http::HttpBackend;
pub use orchestrator::{JITTER_FRACTION, PaginationPolicy, ScrapeOrchestrator, ScrapeResult, jittered};
pub use resolver::{ConfigResolver, DirConfigResolver, StaticConfigResolver};
pub use select::{
    BackendFactory, BackendSelector, DefaultBackendFactory, FixedSelector, HeuristicSelector,
    looks_script_rendered,
};
