//! Page content extraction.
//!
//! Turns a fetched HTML page into its title, normalized main text (HTML
//! converted to Markdown with `htmd`, then cleaned) and the list of outbound
//! links a crawler may follow.

mod cleanup;

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use tramit_shared::{CrawlConfig, Result, TramitError};

/// Content containers tried when no selectors are configured.
const DEFAULT_CONTENT_SELECTORS: &[&str] = &[
    "main",
    "[role=\"main\"]",
    "article",
    "div.content",
    "div.main",
    "div.tramit-steps",
    "div.container",
    "div.article",
    "div.blocs",
];

/// Elements dropped during conversion.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
];

/// Page chrome removed from containers before conversion.
const CHROME_SELECTOR: &str = ".hidden-xs, .sidebar";

/// URL schemes that never lead to a crawlable page.
const SCRIPT_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:", "data:"];

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What a crawler keeps from one page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub main_content: String,
    /// Same-host http(s) links in document order, without duplicates.
    pub links: Vec<Url>,
}

/// Extracts main text and followable links from HTML pages.
#[derive(Debug, Clone)]
pub struct ContentExtractor {
    content_selectors: Vec<Selector>,
    chrome: Selector,
    skip_extensions: Vec<String>,
}

impl ContentExtractor {
    /// Build an extractor. An empty `content_selectors` list uses the built-in
    /// containers; an unparsable selector is a config error.
    pub fn new(content_selectors: &[String], skip_extensions: &[String]) -> Result<Self> {
        let sources: Vec<&str> = if content_selectors.is_empty() {
            DEFAULT_CONTENT_SELECTORS.to_vec()
        } else {
            content_selectors.iter().map(String::as_str).collect()
        };

        let content_selectors = sources
            .into_iter()
            .map(parse_selector)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            content_selectors,
            chrome: parse_selector(CHROME_SELECTOR)?,
            skip_extensions: skip_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        })
    }

    pub fn from_config(config: &CrawlConfig) -> Result<Self> {
        Self::new(&config.content_selectors, &config.skip_extensions)
    }

    /// True if the URL path ends with one of the skipped extensions.
    pub fn is_skipped_resource(&self, url: &Url) -> bool {
        has_skipped_extension(url, &self.skip_extensions)
    }

    /// Extract title, main content, and followable links from `html`.
    #[instrument(skip_all, fields(url = %page_url))]
    pub fn extract(&self, html: &str, page_url: &Url) -> Result<ExtractedPage> {
        let doc = Html::parse_document(html);

        let title = extract_title(&doc);
        let main_content = self.extract_main_content(&doc, page_url)?;
        let links = self.extract_links(&doc, page_url);

        debug!(
            chars = main_content.len(),
            links = links.len(),
            "page extracted"
        );

        Ok(ExtractedPage {
            title,
            main_content,
            links,
        })
    }

    fn extract_main_content(&self, doc: &Html, page_url: &Url) -> Result<String> {
        let containers = self.content_containers(doc);

        let fragments: Vec<String> = if containers.is_empty() {
            body_or_document(doc)
        } else {
            containers.iter().map(|el| self.without_chrome(el)).collect()
        };

        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(SKIP_TAGS.to_vec())
            .build();

        let mut sections = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            let markdown = converter
                .convert(fragment)
                .map_err(|e| TramitError::Conversion(format!("htmd conversion failed: {e}")))?;
            let cleaned = cleanup::run_pipeline(&markdown, Some(page_url));
            if !cleaned.is_empty() {
                sections.push(cleaned);
            }
        }

        Ok(sections.join("\n\n"))
    }

    /// Matching containers in document order, skipping any nested inside an
    /// earlier match.
    fn content_containers<'a>(&self, doc: &'a Html) -> Vec<ElementRef<'a>> {
        let mut containers: Vec<ElementRef<'a>> = Vec::new();

        for node in doc.root_element().descendants() {
            let Some(el) = ElementRef::wrap(node) else {
                continue;
            };
            if !self.content_selectors.iter().any(|s| s.matches(&el)) {
                continue;
            }
            let nested = el
                .ancestors()
                .any(|a| containers.iter().any(|c| c.id() == a.id()));
            if !nested {
                containers.push(el);
            }
        }

        containers
    }

    /// Outer HTML of a container with chrome elements cut out.
    fn without_chrome(&self, el: &ElementRef) -> String {
        let mut html = el.html();
        for chrome in el.select(&self.chrome) {
            html = html.replacen(&chrome.html(), "", 1);
        }
        html
    }

    fn extract_links(&self, doc: &Html, page_url: &Url) -> Vec<Url> {
        static ANCHOR: std::sync::LazyLock<Selector> =
            std::sync::LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for el in doc.select(&ANCHOR) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            let Some(url) = self.followable(href, page_url) else {
                continue;
            };
            if seen.insert(url.as_str().to_string()) {
                links.push(url);
            }
        }

        links
    }

    /// Resolve `href` and keep it only if a crawler should follow it.
    fn followable(&self, href: &str, page_url: &Url) -> Option<Url> {
        let href = href.trim();
        if href.is_empty() || href.contains('#') {
            return None;
        }
        let lower = href.to_ascii_lowercase();
        if SCRIPT_SCHEMES.iter().any(|s| lower.starts_with(s)) {
            return None;
        }

        let url = page_url.join(href).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        if url.host_str() != page_url.host_str()
            || url.port_or_known_default() != page_url.port_or_known_default()
        {
            return None;
        }
        if self.is_skipped_resource(&url) {
            return None;
        }

        Some(url)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| TramitError::config(format!("invalid CSS selector '{s}': {e}")))
}

/// `<title>` text, else the first `<h1>`.
fn extract_title(doc: &Html) -> Option<String> {
    ["title", "h1"].iter().find_map(|tag| {
        let selector = Selector::parse(tag).ok()?;
        let el = doc.select(&selector).next()?;
        let text = el.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    })
}

fn body_or_document(doc: &Html) -> Vec<String> {
    let body = Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next().map(|b| b.html()));
    vec![body.unwrap_or_else(|| doc.root_element().html())]
}

/// True if the last path segment ends with `.{ext}` for one of `extensions`
/// (lower-case, no leading dot).
pub fn has_skipped_extension(url: &Url, extensions: &[String]) -> bool {
    let path = url.path().to_ascii_lowercase();
    let last = path.rsplit('/').next().unwrap_or_default();
    match last.rsplit_once('.') {
        Some((_, ext)) => extensions.iter().any(|e| e == ext),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ContentExtractor {
        ContentExtractor::from_config(&CrawlConfig::default()).unwrap()
    }

    fn page() -> Url {
        Url::parse("https://web.gencat.cat/ca/tramits/beca").unwrap()
    }

    #[test]
    fn extracts_title_from_title_tag() {
        let html = "<html><head><title> Beca  general </title></head><body><h1>Other</h1></body></html>";
        let out = extractor().extract(html, &page()).unwrap();
        assert_eq!(out.title.as_deref(), Some("Beca general"));
    }

    #[test]
    fn falls_back_to_h1_title() {
        let html = "<html><body><main><h1>Padró</h1><p>Text</p></main></body></html>";
        let out = extractor().extract(html, &page()).unwrap();
        assert_eq!(out.title.as_deref(), Some("Padró"));
    }

    #[test]
    fn main_content_skips_chrome() {
        let html = r#"<html><body>
            <header><p>Capçalera</p></header>
            <nav><a href="/ca/inici">Inici</a></nav>
            <div class="content">
                <h2>Requisits</h2>
                <p>Cal estar empadronat.</p>
                <div class="hidden-xs">Menú mòbil</div>
                <script>var x = 1;</script>
            </div>
            <footer><p>Peu de pàgina</p></footer>
        </body></html>"#;

        let out = extractor().extract(html, &page()).unwrap();
        assert!(out.main_content.contains("Requisits"));
        assert!(out.main_content.contains("Cal estar empadronat."));
        assert!(!out.main_content.contains("Menú mòbil"));
        assert!(!out.main_content.contains("var x"));
        assert!(!out.main_content.contains("Peu de pàgina"));
        assert!(!out.main_content.contains("Capçalera"));
    }

    #[test]
    fn nested_containers_are_not_duplicated() {
        let html = r#"<html><body>
            <article><div class="content"><p>Only once</p></div></article>
            <div class="blocs"><p>Second block</p></div>
        </body></html>"#;

        let out = extractor().extract(html, &page()).unwrap();
        assert_eq!(out.main_content.matches("Only once").count(), 1);
        assert!(out.main_content.contains("Second block"));
        let first = out.main_content.find("Only once").unwrap();
        let second = out.main_content.find("Second block").unwrap();
        assert!(first < second);
    }

    #[test]
    fn falls_back_to_body() {
        let html = "<html><body><p>Plain body text.</p></body></html>";
        let out = extractor().extract(html, &page()).unwrap();
        assert_eq!(out.main_content, "Plain body text.");
    }

    #[test]
    fn empty_page_has_empty_content() {
        let out = extractor().extract("<html><body></body></html>", &page()).unwrap();
        assert!(out.main_content.is_empty());
        assert!(out.links.is_empty());
        assert!(out.title.is_none());
    }

    #[test]
    fn link_filtering() {
        let html = r##"<html><body>
            <a href="/ca/tramits/padro">Padró</a>
            <a href="https://web.gencat.cat/ca/tramits/ajuts">Ajuts</a>
            <a href="/ca/tramits/padro">Duplicate</a>
            <a href="#contingut">Fragment</a>
            <a href="/ca/tramits/ajuts#termini">Fragment 2</a>
            <a href="javascript:void(0)">Script</a>
            <a href="mailto:info@gencat.cat">Mail</a>
            <a href="https://other.cat/ca/">Other host</a>
            <a href="/docs/model.PDF">PDF</a>
            <a href="ftp://web.gencat.cat/file">FTP</a>
            <a href="renovacio">Relative</a>
        </body></html>"##;

        let out = extractor().extract(html, &page()).unwrap();
        let urls: Vec<&str> = out.links.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "https://web.gencat.cat/ca/tramits/padro",
                "https://web.gencat.cat/ca/tramits/ajuts",
                "https://web.gencat.cat/ca/tramits/renovacio",
            ]
        );
    }

    #[test]
    fn custom_selectors() {
        let ex = ContentExtractor::new(&["section.fitxa".to_string()], &[]).unwrap();
        let html = r#"<html><body><main>Ignored</main><section class="fitxa">Kept</section></body></html>"#;
        let out = ex.extract(html, &page()).unwrap();
        assert_eq!(out.main_content, "Kept");
    }

    #[test]
    fn invalid_selector_is_config_error() {
        let err = ContentExtractor::new(&["div[".to_string()], &[]).unwrap_err();
        assert!(matches!(err, TramitError::Config { .. }));
    }

    #[test]
    fn skipped_extensions() {
        let exts = vec!["pdf".to_string(), "docx".to_string()];
        let pdf = Url::parse("https://x.cat/a/Model.Pdf?v=2").unwrap();
        let html = Url::parse("https://x.cat/a/page.html").unwrap();
        let dir = Url::parse("https://x.cat/a.pdf/page").unwrap();
        assert!(has_skipped_extension(&pdf, &exts));
        assert!(!has_skipped_extension(&html, &exts));
        assert!(!has_skipped_extension(&dir, &exts));
    }
}
