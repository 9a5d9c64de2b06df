//! Bounded-depth, bounded-fanout concurrent crawler.
//!
//! Each seed grows a tree: a page is fetched, up to `max_links_per_page` of
//! its unvisited same-host links are claimed, and those children are explored
//! concurrently before the page itself is recorded in the [`PageForest`].

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use tramit_extract::{ContentExtractor, ExtractedPage};
use tramit_shared::{CrawlConfig, NodeId, PageForest, PageNode, Result, TramitError};

/// Maximum redirects followed per fetch.
const MAX_REDIRECTS: usize = 5;

/// Pages larger than this are not parsed (5 MB).
const MAX_PAGE_BYTES: u64 = 5 * 1024 * 1024;

type NodeFuture = Pin<Box<dyn Future<Output = Option<NodeId>> + Send>>;

// ---------------------------------------------------------------------------
// CrawlOutcome
// ---------------------------------------------------------------------------

/// Counters for one `explore` call.
#[derive(Debug, Clone, Default)]
pub struct CrawlStats {
    pub pages_fetched: usize,
    /// Network, HTTP status, content-type or parse failures.
    pub pages_failed: usize,
    /// Refused before fetching (private host, skipped extension, duplicate seed).
    pub pages_skipped: usize,
    pub duration: Duration,
    pub cancelled: bool,
}

/// Forest produced by one crawl run plus its statistics.
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    pub forest: PageForest,
    pub stats: CrawlStats,
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Concurrent crawler producing one page tree per seed.
pub struct Crawler {
    config: CrawlConfig,
    fetcher: Fetcher,
}

impl Crawler {
    /// Create a new crawler with the given configuration.
    pub fn new(config: CrawlConfig) -> Result<Self> {
        if config.fanout_concurrency == 0 || config.max_in_flight == 0 {
            return Err(TramitError::validation(
                "fanout_concurrency and max_in_flight must be greater than 0",
            ));
        }

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| TramitError::Network(format!("failed to build HTTP client: {e}")))?;

        let extractor = ContentExtractor::from_config(&config)?;

        Ok(Self {
            fetcher: Fetcher {
                client,
                extractor: Arc::new(extractor),
                allow_private_hosts: false,
                rate_limit: Duration::from_millis(config.rate_limit_ms),
            },
            config,
        })
    }

    /// Allow fetching loopback and private addresses (local mirrors, tests).
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.fetcher.allow_private_hosts = allow;
        self
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Fetch and extract a single page, with the same safety checks as a crawl.
    pub async fn fetch_page(&self, url: &Url) -> Result<ExtractedPage> {
        self.fetcher.fetch(url).await
    }

    /// Crawl every seed to `max_depth`, returning the resulting forest.
    ///
    /// Fails only on invalid input (no seeds, `max_depth == 0`). Individual
    /// page failures are logged and leave that node out. Cancelling `cancel`
    /// abandons pending fetches and returns the pages already completed.
    #[instrument(skip_all, fields(seeds = seeds.len(), max_depth = self.config.max_depth))]
    pub async fn explore(&self, seeds: &[Url], cancel: &CancellationToken) -> Result<CrawlOutcome> {
        if seeds.is_empty() {
            return Err(TramitError::validation("crawl needs at least one seed URL"));
        }
        if self.config.max_depth == 0 {
            return Err(TramitError::validation("max_depth must be at least 1"));
        }

        let start = Instant::now();
        info!(
            max_links_per_page = self.config.max_links_per_page,
            fanout = self.config.fanout_concurrency,
            max_in_flight = self.config.max_in_flight,
            "starting crawl"
        );

        let ctx = Arc::new(CrawlContext {
            fetcher: self.fetcher.clone(),
            max_depth: self.config.max_depth,
            max_links: self.config.max_links_per_page,
            fanout: self.config.fanout_concurrency,
            visited: Mutex::new(HashSet::new()),
            in_flight: Semaphore::new(self.config.max_in_flight),
            forest: Mutex::new(PageForest::new()),
            cancel: cancel.clone(),
            fetched: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        });

        let mut fresh = Vec::with_capacity(seeds.len());
        {
            let mut visited = ctx.visited.lock().await;
            for seed in seeds {
                if visited.insert(normalize_url(seed)) {
                    fresh.push(seed.clone());
                } else {
                    ctx.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let roots = explore_all(ctx.clone(), fresh, 0).await;

        let mut forest = std::mem::take(&mut *ctx.forest.lock().await);
        for root in roots {
            forest.add_root(root);
        }

        let stats = CrawlStats {
            pages_fetched: ctx.fetched.load(Ordering::Relaxed),
            pages_failed: ctx.failed.load(Ordering::Relaxed),
            pages_skipped: ctx.skipped.load(Ordering::Relaxed),
            duration: start.elapsed(),
            cancelled: cancel.is_cancelled(),
        };

        info!(
            pages_fetched = stats.pages_fetched,
            pages_failed = stats.pages_failed,
            pages_skipped = stats.pages_skipped,
            nodes = forest.len(),
            cancelled = stats.cancelled,
            duration_ms = stats.duration.as_millis(),
            "crawl completed"
        );

        Ok(CrawlOutcome { forest, stats })
    }
}

// ---------------------------------------------------------------------------
// Crawl state
// ---------------------------------------------------------------------------

/// State shared by every task of one `explore` call.
struct CrawlContext {
    fetcher: Fetcher,
    max_depth: u32,
    max_links: usize,
    fanout: usize,
    /// Normalized URLs already claimed by some branch.
    visited: Mutex<HashSet<String>>,
    /// Crawl-wide bound on simultaneous fetches.
    in_flight: Semaphore,
    forest: Mutex<PageForest>,
    cancel: CancellationToken,
    fetched: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl CrawlContext {
    /// Claim up to `max_links` unvisited links, in document order.
    async fn claim_links(&self, links: Vec<Url>) -> Vec<Url> {
        let mut visited = self.visited.lock().await;
        links
            .into_iter()
            .filter(|link| visited.insert(normalize_url(link)))
            .take(self.max_links)
            .collect()
    }

    async fn fetch(&self, url: &Url) -> Result<ExtractedPage> {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(cancelled(url)),
            permit = self.in_flight.acquire() => permit
                .map_err(|e| TramitError::Network(format!("fetch pool closed: {e}")))?,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(cancelled(url)),
            page = self.fetcher.fetch(url) => page,
        }
    }
}

fn cancelled(url: &Url) -> TramitError {
    TramitError::Network(format!("{url}: crawl cancelled"))
}

/// Explore `urls` (already claimed) concurrently, `fanout` at a time, and
/// return the ids of the nodes that completed, in input order.
async fn explore_all(ctx: Arc<CrawlContext>, urls: Vec<Url>, depth: u32) -> Vec<NodeId> {
    let width = Arc::new(Semaphore::new(ctx.fanout));
    let mut set = JoinSet::new();

    for (position, url) in urls.into_iter().enumerate() {
        let ctx = ctx.clone();
        let width = width.clone();
        set.spawn(async move {
            let _permit = width.acquire_owned().await.ok()?;
            explore_node(ctx, url, depth).await.map(|id| (position, id))
        });
    }

    let mut done = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(pair)) => done.push(pair),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "crawl task failed"),
        }
    }

    done.sort_by_key(|(position, _)| *position);
    done.into_iter().map(|(_, id)| id).collect()
}

/// Fetch one claimed URL, explore its children, then record the node.
fn explore_node(ctx: Arc<CrawlContext>, url: Url, depth: u32) -> NodeFuture {
    Box::pin(async move {
        if depth >= ctx.max_depth || ctx.cancel.is_cancelled() {
            return None;
        }

        debug!(%url, depth, "fetching page");
        let page = match ctx.fetch(&url).await {
            Ok(page) => page,
            Err(TramitError::Validation { message }) => {
                debug!(%url, reason = %message, "page skipped");
                ctx.skipped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(%url, error = %e, "page fetch failed");
                ctx.failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        ctx.fetched.fetch_add(1, Ordering::Relaxed);

        let children = if depth + 1 < ctx.max_depth && ctx.max_links > 0 {
            let claimed = ctx.claim_links(page.links).await;
            explore_all(ctx.clone(), claimed, depth + 1).await
        } else {
            Vec::new()
        };

        let node = PageNode {
            url: url.to_string(),
            title: page.title,
            main_content: page.main_content,
            children,
            depth,
        };
        let id = ctx.forest.lock().await.push(node);
        Some(id)
    })
}

// ---------------------------------------------------------------------------
// Page fetching
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Fetcher {
    client: Client,
    extractor: Arc<ContentExtractor>,
    allow_private_hosts: bool,
    rate_limit: Duration,
}

impl Fetcher {
    /// Refusals are `Validation` errors; everything else that goes wrong is
    /// `Network` or `Parse`.
    async fn fetch(&self, url: &Url) -> Result<ExtractedPage> {
        if !self.allow_private_hosts && is_ssrf_target(url) {
            return Err(TramitError::validation(format!(
                "{url}: refusing to fetch private or non-http address"
            )));
        }
        if self.extractor.is_skipped_resource(url) {
            return Err(TramitError::validation(format!(
                "{url}: not an HTML resource"
            )));
        }

        if !self.rate_limit.is_zero() {
            tokio::time::sleep(self.rate_limit).await;
        }

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| TramitError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TramitError::Network(format!("{url}: HTTP {status}")));
        }

        if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
            let content_type = content_type.to_str().unwrap_or_default().to_ascii_lowercase();
            if !content_type.contains("html") {
                return Err(TramitError::parse(format!(
                    "{url}: unexpected content type '{content_type}'"
                )));
            }
        }

        if let Some(len) = response.content_length() {
            if len > MAX_PAGE_BYTES {
                return Err(TramitError::parse(format!(
                    "{url}: page too large ({len} bytes, max {MAX_PAGE_BYTES})"
                )));
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| TramitError::Network(format!("{url}: body read failed: {e}")))?;

        self.extractor.extract(&body, url)
    }
}

/// Normalize a URL for the visited set (strip fragment and trailing slash).
fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Keep the slash of a bare origin
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
