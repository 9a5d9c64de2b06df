//! Search result page parser.
//!
//! Result anchors (`a.result__a`, or every anchor when the page has none)
//! are resolved against the search endpoint, redirect wrappers carrying the
//! target in a `uddg` parameter are unwrapped, and links back to the search
//! engine itself are dropped.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

/// Anchors of organic results on an HTML search page.
static RESULT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.result__a").expect("result selector"));

static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

/// Query parameter holding the real target of a redirect link.
const REDIRECT_PARAM: &str = "uddg";

/// Extract up to `limit` result URLs from a search results page, in order.
pub(crate) fn parse_results(html: &str, endpoint: &Url, limit: usize) -> Vec<Url> {
    let doc = Html::parse_document(html);

    let mut hrefs: Vec<&str> = doc
        .select(&RESULT_SELECTOR)
        .filter_map(|a| a.value().attr("href"))
        .collect();
    if hrefs.is_empty() {
        hrefs = doc
            .select(&ANCHOR_SELECTOR)
            .filter_map(|a| a.value().attr("href"))
            .collect();
    }

    let engine_host = endpoint.host_str().unwrap_or_default().to_ascii_lowercase();
    let mut seen = HashSet::new();

    hrefs
        .into_iter()
        .filter_map(|href| endpoint.join(href.trim()).ok())
        .map(unwrap_redirect)
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter(|url| !is_engine_host(url.host_str().unwrap_or_default(), &engine_host))
        .filter(|url| seen.insert(url.as_str().to_string()))
        .take(limit)
        .collect()
}

/// Replace a redirect wrapper with the URL it points to.
fn unwrap_redirect(url: Url) -> Url {
    url.query_pairs()
        .find(|(key, _)| key == REDIRECT_PARAM)
        .and_then(|(_, target)| Url::parse(&target).ok())
        .unwrap_or(url)
}

/// True if `host` belongs to the search engine (same registrable-ish domain).
fn is_engine_host(host: &str, engine_host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    if engine_host.parse::<IpAddr>().is_ok() || engine_host.starts_with('[') {
        return host == engine_host;
    }

    let labels: Vec<&str> = engine_host.rsplit('.').take(2).collect();
    let domain = labels.into_iter().rev().collect::<Vec<_>>().join(".");
    host == domain || host.ends_with(&format!(".{domain}"))
}
