//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use tramit_core::pipeline::{ProgressReporter, ResearchOutcome, ResearchSession, SESSION_DB_FILE};
use tramit_core::{DocumentStore, ingest_file, ingest_url, providers};
use tramit_crawler::Crawler;
use tramit_selector::{HttpVerifier, SourceSelector};
use tramit_shared::{
    AppConfig, CrawlConfig, DocType, DocumentId, GroundedAnswer, PageForest, SelectorConfig,
    StoreConfig, config_file_path, init_config, load_config,
};

/// Characters of a chunk shown by `docs search`.
const SEARCH_PREVIEW_CHARS: usize = 160;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Tramit: answers about administrative procedures, grounded in official pages.
#[derive(Parser)]
#[command(
    name = "tramit",
    version,
    about = "Research administrative procedures on the web and answer with citations.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Session whose documents and index are used (defaults to `[defaults].session`).
    #[arg(long, short = 's', env = "TRAMIT_SESSION", global = true)]
    pub session: Option<String>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Ask a question. Session documents are tried first, then the web.
    Ask {
        /// The question, in any language.
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,

        /// Skip the session documents and research the web directly.
        #[arg(long)]
        research: bool,
    },

    /// Crawl pages from one or more seed URLs and print the page tree.
    Crawl {
        /// Seed URLs.
        #[arg(required = true, num_args = 1..)]
        urls: Vec<String>,

        /// Maximum crawl depth (seeds are depth 0).
        #[arg(long)]
        depth: Option<u32>,

        /// Children followed per page.
        #[arg(long)]
        links: Option<usize>,

        /// Run source selection for this query over the crawled pages.
        #[arg(long, value_name = "QUERY")]
        select: Option<String>,

        /// Print the page forest as JSON instead of a tree.
        #[arg(long)]
        json: bool,
    },

    /// Manage the documents of a session.
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum DocsAction {
    /// Add a PDF, or a text file such as OCR output.
    Add {
        file: PathBuf,

        /// Document title (defaults to the file name).
        #[arg(long)]
        title: Option<String>,

        /// Document type: pdf, image or web.
        #[arg(long = "type", default_value = "pdf")]
        doc_type: DocType,
    },
    /// Fetch a page and add its main content.
    AddUrl { url: String },
    /// List the documents in the session.
    List,
    /// Remove a document by id.
    Remove { id: String },
    /// Show the chunks closest to a query.
    Search {
        query: String,

        /// Number of chunks to return (defaults to `[store].k`).
        #[arg(short)]
        k: Option<usize>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. `RUST_LOG` takes precedence.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "warn,tramit=info",
        1 => "warn,tramit=debug",
        _ => "info,tramit=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let session = cli.session;
    match cli.command {
        Command::Ask { question, research } => {
            cmd_ask(session.as_deref(), &question.join(" "), research).await
        }
        Command::Crawl {
            urls,
            depth,
            links,
            select,
            json,
        } => cmd_crawl(&urls, depth, links, select.as_deref(), json).await,
        Command::Docs { action } => {
            let config = load_config()?;
            let session = session.unwrap_or_else(|| config.defaults.session.clone());
            match action {
                DocsAction::Add {
                    file,
                    title,
                    doc_type,
                } => cmd_docs_add(&config, &session, &file, title.as_deref(), doc_type).await,
                DocsAction::AddUrl { url } => cmd_docs_add_url(&config, &session, &url).await,
                DocsAction::List => cmd_docs_list(&config, &session).await,
                DocsAction::Remove { id } => cmd_docs_remove(&config, &session, &id).await,
                DocsAction::Search { query, k } => {
                    cmd_docs_search(&config, &session, &query, k).await
                }
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(force),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// ask
// ---------------------------------------------------------------------------

async fn cmd_ask(session: Option<&str>, question: &str, research: bool) -> Result<()> {
    let config = load_config()?;
    let name = session.unwrap_or(config.defaults.session.as_str());
    let session = ResearchSession::open(&config, name).await?;

    cancel_on_ctrl_c(session.cancellation_token());

    info!(session = session.name(), research, "answering question");
    let reporter = CliProgress::new();
    let outcome = if research {
        session.research(question, &reporter).await?
    } else {
        session.ask(question, &reporter).await?
    };

    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &ResearchOutcome) {
    println!();
    print_answer(&outcome.answer);

    if outcome.from_store {
        println!("  (answered from session documents)");
    } else {
        let fetched: usize = outcome.crawls.iter().map(|c| c.pages_fetched).sum();
        let chunks: usize = outcome.documents.iter().map(|(_, n)| n).sum();
        println!(
            "  Queries: {}  Pages: {fetched}  Sources: {}  New chunks: {chunks}",
            outcome.queries.len(),
            outcome.sources.len(),
        );
    }
    println!("  Time:    {:.1}s", outcome.elapsed.as_secs_f64());
    println!();
}

fn print_answer(answer: &GroundedAnswer) {
    println!("{}", answer.response);
    if answer.citations.is_empty() {
        println!();
        return;
    }
    println!();
    for citation in &answer.citations {
        let location = citation.source_url.as_deref().unwrap_or("uploaded");
        println!(
            "  [{}] {} ({}, {location})",
            citation.number, citation.doc_title, citation.doc_type
        );
    }
    println!();
}

/// Cancel `token` on the first ctrl-c so in-flight crawls stop and the
/// pipeline finishes with what it already fetched.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping crawl");
            token.cancel();
        }
    });
}

// ---------------------------------------------------------------------------
// crawl
// ---------------------------------------------------------------------------

async fn cmd_crawl(
    urls: &[String],
    depth: Option<u32>,
    links: Option<usize>,
    select: Option<&str>,
    json: bool,
) -> Result<()> {
    let config = load_config()?;
    let seeds = urls
        .iter()
        .map(|u| Url::parse(u).map_err(|e| eyre!("invalid URL '{u}': {e}")))
        .collect::<Result<Vec<_>>>()?;

    let mut crawl_config = CrawlConfig::from(&config);
    if let Some(depth) = depth {
        crawl_config.max_depth = depth;
    }
    if let Some(links) = links {
        crawl_config.max_links_per_page = links;
    }
    let user_agent = crawl_config.user_agent.clone();
    let crawler = Crawler::new(crawl_config)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let spinner = new_spinner(&format!("Crawling {} seed(s)", seeds.len()));
    let outcome = crawler.explore(&seeds, &cancel).await;
    spinner.finish_and_clear();
    let outcome = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.forest)?);
    } else {
        print_forest(&outcome.forest);
    }

    let stats = &outcome.stats;
    eprintln!(
        "  Fetched: {}  Failed: {}  Skipped: {}  Time: {:.1}s{}",
        stats.pages_fetched,
        stats.pages_failed,
        stats.pages_skipped,
        stats.duration.as_secs_f64(),
        if stats.cancelled { "  (cancelled)" } else { "" },
    );

    if let Some(query) = select {
        let llm = providers::completion_service(&config.llm)?;
        let selector_config = SelectorConfig::from(&config);
        let verifier = HttpVerifier::new(selector_config.liveness_timeout_secs, &user_agent)?;
        let mut selector = SourceSelector::new(selector_config, llm, Arc::new(verifier));

        let spinner = new_spinner("Selecting sources");
        selector.append_forest(query, &outcome.forest).await;
        let sources = selector.final_sources(query).await;
        spinner.finish_and_clear();

        println!();
        println!("  Selected {} source(s) for \"{query}\":", sources.len());
        for source in &sources {
            match &source.title {
                Some(title) => println!("  - {title}\n    {}", source.url),
                None => println!("  - {}", source.url),
            }
        }
        println!();
    }

    Ok(())
}

fn print_forest(forest: &PageForest) {
    for node in forest.walk() {
        let indent = "  ".repeat(node.depth as usize + 1);
        let title = node.title.as_deref().unwrap_or("(untitled)");
        println!(
            "{indent}{title}  <{}>  [{} chars]",
            node.url,
            node.main_content.chars().count()
        );
    }
}

// ---------------------------------------------------------------------------
// docs
// ---------------------------------------------------------------------------

/// Open the session's store. The completion service is only needed for
/// answers, so a missing API key does not prevent managing documents.
async fn open_store(config: &AppConfig, session: &str) -> Result<DocumentStore> {
    let dir = config.defaults.session_dir(session)?;
    let store = DocumentStore::open(
        &dir.join(SESSION_DB_FILE),
        StoreConfig::from(config),
        providers::embedder(config)?,
        providers::completion_service_or_disabled(&config.llm),
    )
    .await?;
    Ok(store)
}

async fn cmd_docs_add(
    config: &AppConfig,
    session: &str,
    file: &Path,
    title: Option<&str>,
    doc_type: DocType,
) -> Result<()> {
    let store = open_store(config, session).await?;
    let (doc, chunks) = ingest_file(&store, file, title, doc_type).await?;

    println!("  Added \"{}\" ({}, {chunks} chunks)", doc.title, doc.doc_type);
    println!("  ID: {}", doc.id);
    Ok(())
}

async fn cmd_docs_add_url(config: &AppConfig, session: &str, url: &str) -> Result<()> {
    let url = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
    let store = open_store(config, session).await?;
    if store.contains_source(url.as_str()).await {
        return Err(eyre!("'{url}' is already in session '{session}'"));
    }
    let crawler = Crawler::new(CrawlConfig::from(config))?;

    let spinner = new_spinner(&format!("Fetching {url}"));
    let added = ingest_url(&store, &crawler, &url).await;
    spinner.finish_and_clear();
    let (doc, chunks) = added?;

    println!("  Added \"{}\" ({chunks} chunks)", doc.title);
    println!("  ID: {}", doc.id);
    Ok(())
}

async fn cmd_docs_list(config: &AppConfig, session: &str) -> Result<()> {
    let store = open_store(config, session).await?;
    let docs = store.list_documents().await?;

    if docs.is_empty() {
        println!("  No documents in session '{session}'.");
        return Ok(());
    }

    for doc in &docs {
        println!(
            "  {}  {:<5}  {:>4} chunks  {}  {}",
            doc.id,
            doc.doc_type.as_str(),
            doc.chunk_count,
            doc.timestamp.format("%Y-%m-%d %H:%M"),
            doc.title
        );
        if let Some(url) = &doc.source_url {
            println!("  {:>36}  {url}", "");
        }
    }
    println!();
    println!("  {} document(s) in session '{session}'", docs.len());
    Ok(())
}

async fn cmd_docs_remove(config: &AppConfig, session: &str, id: &str) -> Result<()> {
    let id: DocumentId = id
        .parse()
        .map_err(|e| eyre!("invalid document id '{id}': {e}"))?;
    let store = open_store(config, session).await?;

    if !store.remove_document(&id).await? {
        return Err(eyre!("no document '{id}' in session '{session}'"));
    }
    println!("  Removed {id}");
    Ok(())
}

async fn cmd_docs_search(
    config: &AppConfig,
    session: &str,
    query: &str,
    k: Option<usize>,
) -> Result<()> {
    let store = open_store(config, session).await?;
    let k = k.unwrap_or(store.config().k);
    let hits = store.search(query, k).await?;

    if hits.is_empty() {
        println!("  No relevant chunks.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "  [{}] {:.3}  {} #{}",
            i + 1,
            hit.score,
            hit.meta.doc_title,
            hit.meta.chunk_index
        );
        println!("      {}", preview(&hit.text, SEARCH_PREVIEW_CHARS));
    }
    Ok(())
}

/// First `max_chars` characters of `text` on one line.
fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(force: bool) -> Result<()> {
    let path = config_file_path()?;
    if path.exists() && !force {
        return Err(eyre!(
            "config already exists at '{}' (use --force to overwrite)",
            path.display()
        ));
    }
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

fn new_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Renders pipeline progress with an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        Self {
            spinner: new_spinner("Starting"),
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn query_started(&self, query: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Searching [{current}/{total}] {query}"));
    }

    fn source_selected(&self, url: &str) {
        self.spinner.println(format!("  + {url}"));
    }

    fn done(&self, _outcome: &ResearchOutcome) {
        self.spinner.finish_and_clear();
    }
}
