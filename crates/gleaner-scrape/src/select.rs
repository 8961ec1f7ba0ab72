//! Backend selection.
//!
//! Which backend serves a configuration is a swappable strategy: a
//! [`BackendSelector`] decides the [`BackendKind`] for `auto`
//! configurations, and a [`BackendFactory`] turns the decision into a
//! ready-to-run [`FetchBackend`].

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::{BackendKind, FetchBackend, FetchConfig, HttpBackend, ScrapeError};

/// Script content that hints at client-side rendering.
const FRAMEWORK_MARKERS: &[&str] = &[
    "react", "vue", "angular", "ember", "svelte", "backbone", "jquery", "axios", "fetch", "xhr",
    "ajax", "graphql", "renderer", "rendering", "hydrate",
];

/// URL or page text that suggests a storefront.
const STOREFRONT_MARKERS: &[&str] = &["cart", "checkout", "product", "shop", "store", "price"];

/// Pages with less visible text than this are candidates for script rendering.
const THIN_BODY_CHARS: usize = 500;

static MOUNT_POINT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"app|root|container").expect("valid regex"));
static LOADER_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"loader|spinner|loading").expect("valid regex"));
static LISTING_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"product|item|card").expect("valid regex"));
static LAZY_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)load more|infinite scroll|show more").expect("valid regex")
});

/// Decides which backend an `auto` configuration should use.
pub trait BackendSelector: Send + Sync {
    /// `sample_html` is the root page as fetched over plain HTTP, or `None`
    /// when that probe failed.
    fn select(&self, config: &FetchConfig, sample_html: Option<&str>) -> BackendKind;
}

/// Content-sniffing selector.
///
/// Chooses the browser backend when the probe failed or the page looks
/// script-rendered, and plain HTTP otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSelector;

impl BackendSelector for HeuristicSelector {
    fn select(&self, config: &FetchConfig, sample_html: Option<&str>) -> BackendKind {
        match sample_html {
            None => BackendKind::Browser,
            Some(html) if looks_script_rendered(html, &config.url) => BackendKind::Browser,
            Some(_) => BackendKind::Http,
        }
    }
}

/// Selector that always answers the same kind.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelector(pub BackendKind);

impl BackendSelector for FixedSelector {
    fn select(&self, _config: &FetchConfig, _sample_html: Option<&str>) -> BackendKind {
        self.0
    }
}

/// Whether `html` (served from `url`) probably needs JavaScript to show its content.
pub fn looks_script_rendered(html: &str, url: &str) -> bool {
    let document = Html::parse_document(html);
    let select = |css: &str| Selector::parse(css).ok();

    let body_text: String = match select("body") {
        Some(body) => document
            .select(&body)
            .next()
            .map(|b| b.text().collect())
            .unwrap_or_default(),
        None => String::new(),
    };
    let visible_chars = body_text.chars().filter(|c| !c.is_whitespace()).count();

    if visible_chars < THIN_BODY_CHARS
        && let Some(scripts) = select("script")
    {
        let script_text = document
            .select(&scripts)
            .flat_map(|s| s.text())
            .collect::<String>()
            .to_lowercase();
        if FRAMEWORK_MARKERS.iter().any(|m| script_text.contains(m)) {
            return true;
        }
    }

    let count_matching = |css: &str, attr: &str, pattern: &Regex| {
        select(css).map_or(0, |s| {
            document
                .select(&s)
                .filter(|el| el.value().attr(attr).is_some_and(|v| pattern.is_match(v)))
                .count()
        })
    };

    if count_matching("div[id]", "id", &MOUNT_POINT_ID) > 0 {
        return true;
    }

    let page_text: String = document.root_element().text().collect();
    if LAZY_TEXT.is_match(&page_text) {
        return true;
    }

    if count_matching("div[class]", "class", &LOADER_CLASS) > 0 {
        return true;
    }

    let count = |css: &str| select(css).map_or(0, |s| document.select(&s).count());
    if count("[data-reactroot]") > 0 || count(r#"img[loading="lazy"]"#) > 5 {
        return true;
    }

    let url = url.to_lowercase();
    let page_text = page_text.to_lowercase();
    let storefront = STOREFRONT_MARKERS
        .iter()
        .any(|m| url.contains(m) || page_text.contains(m));
    storefront && count_matching("[class]", "class", &LISTING_CLASS) > 5
}

/// Builds the backend for one run.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, config: &FetchConfig) -> Result<Box<dyn FetchBackend>, ScrapeError>;
}

/// Factory serving plain HTTP itself and delegating browser runs to an
/// optional registered factory.
pub struct DefaultBackendFactory {
    selector: Arc<dyn BackendSelector>,
    browser: Option<Arc<dyn BackendFactory>>,
}

impl Default for DefaultBackendFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultBackendFactory {
    pub fn new() -> Self {
        Self {
            selector: Arc::new(HeuristicSelector),
            browser: None,
        }
    }

    /// Replace the selector consulted for `auto` configurations.
    pub fn with_selector(mut self, selector: Arc<dyn BackendSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Register the factory used for browser runs.
    pub fn with_browser(mut self, browser: Arc<dyn BackendFactory>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Resolve `auto` into a concrete kind by probing the root page.
    async fn choose(&self, config: &FetchConfig) -> BackendKind {
        if config.backend != BackendKind::Auto {
            return config.backend;
        }

        let sample = match probe(config).await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(url = %config.url, error = %e, "backend probe failed");
                None
            }
        };
        let kind = self.selector.select(config, sample.as_deref());
        debug!(url = %config.url, backend = %kind, "auto-selected backend");
        kind
    }
}

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(&self, config: &FetchConfig) -> Result<Box<dyn FetchBackend>, ScrapeError> {
        match self.choose(config).await {
            BackendKind::Browser => match &self.browser {
                Some(browser) => browser.create(config).await,
                // An explicit request cannot be honoured; a guess can fall back.
                None if config.backend == BackendKind::Browser => {
                    Err(ScrapeError::UnsupportedBackend(BackendKind::Browser))
                }
                None => {
                    warn!(url = %config.url, "no browser backend registered, using http");
                    Ok(Box::new(HttpBackend::new(config.clone())?))
                }
            },
            BackendKind::Http | BackendKind::Auto => Ok(Box::new(HttpBackend::new(config.clone())?)),
        }
    }
}

/// Fetch the root page once over plain HTTP.
async fn probe(config: &FetchConfig) -> Result<String, ScrapeError> {
    let mut backend = HttpBackend::new(config.clone())?;
    backend.before().await?;
    let body = backend.get_body(&config.url).await;
    backend.after().await?;
    body
}
