//! Plain HTTP backend with CSS-selector extraction.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, warn};

use crate::pagination::{next_url_param, resolve_link};
use crate::{FetchBackend, FetchConfig, PaginationType, Record, ScrapeError};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bodies shorter than this are logged as suspicious.
const SUSPICIOUS_BODY_LEN: usize = 200;

/// Fetches pages with reqwest and extracts fields from static HTML.
pub struct HttpBackend {
    config: FetchConfig,
    fields: Vec<(String, Selector)>,
    next_selector: Option<Selector>,
    client: Option<reqwest::Client>,
    /// Most recently fetched page, reused by next-button pagination.
    last_page: Option<(String, String)>,
}

impl HttpBackend {
    /// Compile the configuration's selectors.
    pub fn new(config: FetchConfig) -> Result<Self, ScrapeError> {
        let fields = config
            .selectors
            .iter()
            .map(|(field, selector)| Ok((field.clone(), parse_selector(selector)?)))
            .collect::<Result<Vec<_>, ScrapeError>>()?;

        let next_selector = match &config.pagination {
            Some(p) if p.kind == PaginationType::NextButton => {
                p.selector.as_deref().map(parse_selector).transpose()?
            }
            _ => None,
        };

        Ok(Self {
            config,
            fields,
            next_selector,
            client: None,
            last_page: None,
        })
    }

    fn client(&self) -> Result<&reqwest::Client, ScrapeError> {
        self.client
            .as_ref()
            .ok_or_else(|| ScrapeError::Fetch("HTTP session not open".to_string()))
    }

    pub(crate) async fn get_body(&mut self, url: &str) -> Result<String, ScrapeError> {
        if let Some((cached_url, body)) = &self.last_page
            && cached_url == url
        {
            return Ok(body.clone());
        }

        debug!(url, "GET");
        let response = self.client()?.get(url).send().await?.error_for_status()?;
        let final_url = response.url().to_string();
        let body = response.text().await?;

        if body.len() < SUSPICIOUS_BODY_LEN || final_url.to_lowercase().contains("login") {
            warn!(url, final_url = %final_url, len = body.len(), "suspicious response");
        }

        self.last_page = Some((url.to_string(), body.clone()));
        Ok(body)
    }

    /// Extract records column-wise: item `i` holds the `i`-th match of every selector.
    pub fn extract(&self, html: &str) -> Vec<Record> {
        let document = Html::parse_document(html);
        let columns: Vec<(&str, Vec<String>)> = self
            .fields
            .iter()
            .map(|(field, selector)| {
                let values = document.select(selector).map(extract_value).collect();
                (field.as_str(), values)
            })
            .collect();

        let rows = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        (0..rows)
            .map(|i| {
                columns
                    .iter()
                    .filter_map(|(field, values)| {
                        values
                            .get(i)
                            .map(|v| (field.to_string(), Value::String(v.clone())))
                    })
                    .collect::<Record>()
            })
            .filter(|record| !record.is_empty())
            .collect()
    }

    fn next_link(&self, html: &str, current_url: &str) -> Result<Option<String>, ScrapeError> {
        let Some(selector) = &self.next_selector else {
            return Ok(None);
        };

        let document = Html::parse_document(html);
        let Some(button) = document.select(selector).next() else {
            debug!("next button not found");
            return Ok(None);
        };

        let href = button.value().attr("href").map(str::to_string).or_else(|| {
            let anchor = Selector::parse("a[href]").ok()?;
            let nested = button
                .select(&anchor)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::to_string);
            nested
        });

        match href {
            Some(href) => resolve_link(current_url, &href).map(Some),
            None => {
                debug!("next button has no link");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl FetchBackend for HttpBackend {
    async fn before(&mut self) -> Result<(), ScrapeError> {
        let mut headers = HeaderMap::new();
        for (name, value) in self.config.effective_headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ScrapeError::InvalidConfig(format!("header '{name}': {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| ScrapeError::InvalidConfig(format!("header value: {e}")))?;
            headers.insert(name, value);
        }

        self.client = Some(
            reqwest::Client::builder()
                .default_headers(headers)
                .timeout(REQUEST_TIMEOUT)
                .build()?,
        );
        Ok(())
    }

    async fn fetch_page(&mut self, url: &str) -> Result<Vec<Record>, ScrapeError> {
        let body = self.get_body(url).await?;
        Ok(self.extract(&body))
    }

    async fn next_page_url(
        &mut self,
        current_url: &str,
        page_index: u32,
    ) -> Result<Option<String>, ScrapeError> {
        let Some(pagination) = self.config.pagination.clone() else {
            return Ok(None);
        };

        match pagination.kind {
            PaginationType::None => Ok(None),
            PaginationType::UrlParam => match pagination.param_name.as_deref() {
                Some(param) => next_url_param(current_url, param, page_index).map(Some),
                None => Ok(None),
            },
            PaginationType::NextButton => {
                let body = self.get_body(current_url).await?;
                self.next_link(&body, current_url)
            }
            PaginationType::LoadMore | PaginationType::InfiniteScroll => {
                warn!(kind = ?pagination.kind, "pagination type needs a browser backend");
                Ok(None)
            }
        }
    }

    async fn after(&mut self) -> Result<(), ScrapeError> {
        self.client = None;
        self.last_page = None;
        Ok(())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector)
        .map_err(|e| ScrapeError::InvalidConfig(format!("selector '{selector}': {e}")))
}

/// The most useful value of an element: link target, image source, input value or text.
fn extract_value(element: ElementRef<'_>) -> String {
    let el = element.value();
    let attr = match el.name() {
        "a" => el.attr("href"),
        "img" => el.attr("src").or_else(|| el.attr("alt")),
        "input" => el.attr("value"),
        _ => None,
    };

    match attr {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => element
            .text()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
    }
}
