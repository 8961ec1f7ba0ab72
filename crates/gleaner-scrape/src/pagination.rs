//! URL helpers shared by backends that implement pagination.

use url::Url;

use crate::ScrapeError;

/// URL of the page after `page_index` using a page-number query parameter.
///
/// Other query pairs keep their order; the page parameter keeps its position
/// when already present and is appended otherwise.
pub fn next_url_param(
    current_url: &str,
    param_name: &str,
    page_index: u32,
) -> Result<String, ScrapeError> {
    let mut url = Url::parse(current_url)?;
    let next_page = (page_index + 1).to_string();

    let mut replaced = false;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            if k == param_name {
                if replaced {
                    return None;
                }
                replaced = true;
                Some((k.into_owned(), next_page.clone()))
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if !replaced {
        pairs.push((param_name.to_string(), next_page));
    }

    url.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(url.to_string())
}

/// Resolve a link found on `current_url` into an absolute URL.
pub fn resolve_link(current_url: &str, href: &str) -> Result<String, ScrapeError> {
    let base = Url::parse(current_url)?;
    Ok(base.join(href.trim())?.to_string())
}
