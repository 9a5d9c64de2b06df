//! Seed discovery for research crawls.
//!
//! Every reformulated query is turned into a handful of starting URLs by a
//! [`SeedSearch`] implementation. [`HtmlSearch`] scrapes the HTML results page
//! of a web search engine, restricted to a site when one is configured and
//! falling back to the whole web when the restricted search finds nothing.

mod parser;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, instrument};
use url::Url;

use tramit_shared::{Result, SearchConfig, TramitError};

/// Maximum number of redirects to follow on a search request.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// SeedSearch
// ---------------------------------------------------------------------------

/// Source of crawl seeds for a query.
#[async_trait]
pub trait SeedSearch: Send + Sync {
    /// Up to `limit` seed URLs for `query`, most relevant first.
    async fn seeds(&self, query: &str, limit: usize) -> Result<Vec<Url>>;
}

// ---------------------------------------------------------------------------
// HtmlSearch
// ---------------------------------------------------------------------------

/// Web search through an HTML results page (`GET {endpoint}?q=...`).
#[derive(Debug, Clone)]
pub struct HtmlSearch {
    client: Client,
    endpoint: Url,
    site: Option<String>,
}

impl HtmlSearch {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            TramitError::config(format!("invalid search endpoint '{}': {e}", config.endpoint))
        })?;

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TramitError::Network(format!("failed to build HTTP client: {e}")))?;

        let site = config
            .site
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        Ok(Self {
            client,
            endpoint,
            site,
        })
    }

    async fn search(&self, q: &str, limit: usize) -> Result<Vec<Url>> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("q", q)])
            .send()
            .await
            .map_err(|e| TramitError::Network(format!("search '{q}': {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TramitError::Network(format!("search '{q}': HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TramitError::Network(format!("search '{q}': failed to read body: {e}")))?;

        Ok(parser::parse_results(&body, &self.endpoint, limit))
    }
}

#[async_trait]
impl SeedSearch for HtmlSearch {
    #[instrument(skip(self), fields(site = self.site.as_deref().unwrap_or("*")))]
    async fn seeds(&self, query: &str, limit: usize) -> Result<Vec<Url>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        if let Some(site) = &self.site {
            let found = self.search(&format!("{query} site:{site}"), limit).await?;
            if !found.is_empty() {
                info!(count = found.len(), "seeds found");
                return Ok(found);
            }
            debug!("site-restricted search empty, searching the whole web");
        }

        let found = self.search(query, limit).await?;
        info!(count = found.len(), "seeds found");
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// StaticSeeds
// ---------------------------------------------------------------------------

/// Fixed seed list, returned for every query.
#[derive(Debug, Clone, Default)]
pub struct StaticSeeds(pub Vec<Url>);

#[async_trait]
impl SeedSearch for StaticSeeds {
    async fn seeds(&self, _query: &str, limit: usize) -> Result<Vec<Url>> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }
}
