//! Per-session research pipeline: question → queries → seeds → crawl →
//! source selection → document store → grounded answer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use tramit_crawler::{CrawlStats, Crawler};
use tramit_discovery::{HtmlSearch, SeedSearch};
use tramit_selector::{HttpVerifier, SourceSelector};
use tramit_shared::{
    AppConfig, CrawlConfig, DocType, DocumentId, GroundedAnswer, PlannerConfig, Result,
    SearchConfig, SelectedSource, SelectorConfig, StoreConfig, TramitError,
};

use crate::planner::QueryPlanner;
use crate::providers;
use crate::store::DocumentStore;

/// File name of a session's database inside its session directory.
pub const SESSION_DB_FILE: &str = "index.db";

// ---------------------------------------------------------------------------
// Outcome and progress
// ---------------------------------------------------------------------------

/// Result of one `research` or `ask` call.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    /// Search queries actually used.
    pub queries: Vec<String>,
    /// Sources that passed the final selection.
    pub sources: Vec<SelectedSource>,
    /// Documents added to the store, with their chunk counts.
    pub documents: Vec<(DocumentId, usize)>,
    pub answer: GroundedAnswer,
    /// One entry per crawl run.
    pub crawls: Vec<CrawlStats>,
    /// True when the answer came from documents already in the session.
    pub from_store: bool,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called before the seeds of a query are searched and crawled.
    fn query_started(&self, query: &str, current: usize, total: usize);
    /// Called for every source that survived the final selection.
    fn source_selected(&self, url: &str);
    /// Called when the pipeline completes.
    fn done(&self, outcome: &ResearchOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn query_started(&self, _query: &str, _current: usize, _total: usize) {}
    fn source_selected(&self, _url: &str) {}
    fn done(&self, _outcome: &ResearchOutcome) {}
}

// ---------------------------------------------------------------------------
// ResearchSession
// ---------------------------------------------------------------------------

/// Everything one chat session owns. Sessions share nothing.
pub struct ResearchSession {
    name: String,
    store: DocumentStore,
    selector: Mutex<SourceSelector>,
    crawler: Crawler,
    planner: QueryPlanner,
    search: Arc<dyn SeedSearch>,
    results_per_query: usize,
    cancel: CancellationToken,
}

impl ResearchSession {
    pub fn new(
        name: impl Into<String>,
        store: DocumentStore,
        selector: SourceSelector,
        crawler: Crawler,
        planner: QueryPlanner,
        search: Arc<dyn SeedSearch>,
        results_per_query: usize,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            selector: Mutex::new(selector),
            crawler,
            planner,
            search,
            results_per_query: results_per_query.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Build the session `name` from the application config, opening (or
    /// creating) its database under the data directory.
    #[instrument(skip(config))]
    pub async fn open(config: &AppConfig, name: &str) -> Result<Self> {
        let dir = config.defaults.session_dir(name)?;
        let llm = providers::completion_service(&config.llm)?;
        let embedder = providers::embedder(config)?;

        let store = DocumentStore::open(
            &dir.join(SESSION_DB_FILE),
            StoreConfig::from(config),
            embedder,
            llm.clone(),
        )
        .await?;

        let selector_config = SelectorConfig::from(config);
        let verifier = HttpVerifier::new(
            selector_config.liveness_timeout_secs,
            &config.crawl.user_agent,
        )?;
        let selector = SourceSelector::new(selector_config, llm.clone(), Arc::new(verifier));

        let crawler = Crawler::new(CrawlConfig::from(config))?;
        let planner = QueryPlanner::new(PlannerConfig::from(config), llm);
        let search_config = SearchConfig::from(config);
        let search = HtmlSearch::new(&search_config)?;

        info!(session = name, dir = %dir.display(), "session opened");
        Ok(Self::new(
            name,
            store,
            selector,
            crawler,
            planner,
            Arc::new(search),
            search_config.results_per_query,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn crawler(&self) -> &Crawler {
        &self.crawler
    }

    /// Abort in-flight crawls. Pages already fetched are kept; later research
    /// calls on this session do no crawling.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Answer from the session's documents first; research the web only when
    /// they hold nothing relevant.
    #[instrument(skip_all, fields(session = %self.name))]
    pub async fn ask(
        &self,
        question: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<ResearchOutcome> {
        let question = validate_question(question)?;
        let start = Instant::now();

        if !self.store.is_empty().await {
            progress.phase("Searching session documents");
            match self.store.generate_response(question, self.store.config().k).await {
                Ok(answer) if !answer.is_no_context() => {
                    let outcome = ResearchOutcome {
                        queries: Vec::new(),
                        sources: Vec::new(),
                        documents: Vec::new(),
                        answer,
                        crawls: Vec::new(),
                        from_store: true,
                        elapsed: start.elapsed(),
                    };
                    progress.done(&outcome);
                    return Ok(outcome);
                }
                Ok(_) => info!("session documents hold no answer, researching"),
                Err(e) => warn!(error = %e, "answering from session documents failed"),
            }
        }

        self.research(question, progress).await
    }

    /// Run the full web research pipeline for `question`.
    #[instrument(skip_all, fields(session = %self.name))]
    pub async fn research(
        &self,
        question: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<ResearchOutcome> {
        let question = validate_question(question)?;
        let start = Instant::now();

        // --- Phase 1: Plan ---
        progress.phase("Planning search queries");
        let queries = match self.planner.reformulate(question).await {
            Ok(queries) => queries,
            Err(e) => {
                warn!(error = %e, "query planning failed, searching the question itself");
                vec![question.to_string()]
            }
        };

        // --- Phase 2: Search, crawl and screen per query ---
        let mut selector = self.selector.lock().await;
        selector.reset();
        let mut crawls = Vec::new();

        for (i, query) in queries.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("research cancelled");
                break;
            }
            progress.query_started(query, i + 1, queries.len());

            let seeds = match self.search.seeds(query, self.results_per_query).await {
                Ok(seeds) if !seeds.is_empty() => seeds,
                Ok(_) => {
                    info!(%query, "no seeds found");
                    continue;
                }
                Err(e) => {
                    warn!(%query, error = %e, "seed search failed");
                    continue;
                }
            };

            let outcome = match self.crawler.explore(&seeds, &self.cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%query, error = %e, "crawl failed");
                    continue;
                }
            };
            selector.append_forest(query, &outcome.forest).await;
            crawls.push(outcome.stats);
        }

        // --- Phase 3: Final selection against the real question ---
        progress.phase("Selecting sources");
        let sources = selector.final_sources(question).await;
        drop(selector);

        // --- Phase 4: Store ---
        progress.phase("Indexing sources");
        let mut documents = Vec::new();
        for source in &sources {
            progress.source_selected(&source.url);
            if self.store.contains_source(&source.url).await {
                info!(url = %source.url, "source already indexed");
                continue;
            }
            let title = source.title.as_deref().unwrap_or(&source.url);
            match self
                .store
                .add_document(title, &source.content, DocType::Web, Some(&source.url))
                .await
            {
                Ok((doc, chunks)) => documents.push((doc.id, chunks)),
                Err(e) => warn!(url = %source.url, error = %e, "failed to index source"),
            }
        }

        // --- Phase 5: Answer ---
        progress.phase("Generating answer");
        let answer = match self.store.generate_response(question, self.store.config().k).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(error = %e, "answer generation failed");
                GroundedAnswer::no_context()
            }
        };

        let outcome = ResearchOutcome {
            queries,
            sources,
            documents,
            answer,
            crawls,
            from_store: false,
            elapsed: start.elapsed(),
        };
        progress.done(&outcome);

        info!(
            queries = outcome.queries.len(),
            sources = outcome.sources.len(),
            documents = outcome.documents.len(),
            citations = outcome.answer.citations.len(),
            elapsed_ms = outcome.elapsed.as_millis(),
            "research complete"
        );
        Ok(outcome)
    }
}

fn validate_question(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(TramitError::validation("question is empty"));
    }
    Ok(question)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tramit_discovery::StaticSeeds;
    use tramit_llm::HashingEmbedder;
    use tramit_llm::testing::ScriptedCompletion;
    use url::Url;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUESTION: &str = "Quines beques hi ha per a la universitat?";

    /// Plans one query, echoes every offered URL back as relevant and
    /// answers with a fixed cited sentence.
    fn scripted_llm() -> ScriptedCompletion {
        ScriptedCompletion::new().responding_with(|request| {
            let system = &request.messages[0].content;
            let user = request.user_prompt().unwrap_or_default();
            if system.starts_with("You turn questions") {
                Ok("beques universitat".into())
            } else if system.contains("synthesizes") {
                Ok(user.to_string())
            } else {
                Ok("Pots demanar la beca general [1].".into())
            }
        })
    }

    async fn mount_site(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/tramits/beca"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><head><title>Beques</title></head><body><main>\
                 <p>Informació general sobre ajuts.</p>\
                 <a href=\"/tramits/beca/requisits\">Requisits</a>\
                 </main></body></html>",
                "text/html",
            ))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tramits/beca/requisits"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><head><title>Requisits de la beca</title></head><body><main>\
                 <p>Requisits de les beques per a la universitat: matrícula i renda.</p>\
                 </main></body></html>",
                "text/html",
            ))
            .mount(server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    async fn session(
        llm: ScriptedCompletion,
        seeds: Vec<Url>,
    ) -> (ResearchSession, Arc<ScriptedCompletion>) {
        let llm = Arc::new(llm);
        let db = std::env::temp_dir().join(format!("tramit_session_{}.db", Uuid::now_v7()));
        let store = DocumentStore::open(
            &db,
            StoreConfig::default(),
            Arc::new(HashingEmbedder::new(384).unwrap()),
            llm.clone(),
        )
        .await
        .unwrap();
        let verifier = HttpVerifier::new(5, "tramit-test").unwrap();
        let selector = SourceSelector::new(SelectorConfig::default(), llm.clone(), Arc::new(verifier));
        let crawler = Crawler::new(CrawlConfig {
            fetch_timeout_secs: 5,
            ..CrawlConfig::default()
        })
        .unwrap()
        .allow_private_hosts(true);
        let planner = QueryPlanner::new(PlannerConfig::default(), llm.clone());

        let session = ResearchSession::new(
            "test",
            store,
            selector,
            crawler,
            planner,
            Arc::new(StaticSeeds(seeds)),
            2,
        );
        (session, llm)
    }

    #[tokio::test]
    async fn research_end_to_end() {
        let server = MockServer::start().await;
        mount_site(&server).await;
        let seed = Url::parse(&format!("{}/tramits/beca", server.uri())).unwrap();
        let (session, _) = session(scripted_llm(), vec![seed]).await;

        let outcome = session.research(QUESTION, &SilentProgress).await.unwrap();

        let requisits = format!("{}/tramits/beca/requisits", server.uri());
        assert_eq!(outcome.queries, vec!["beques universitat"]);
        assert_eq!(outcome.crawls.len(), 1);
        assert_eq!(outcome.crawls[0].pages_fetched, 2);
        // The section page is pruned in favour of its more specific child
        assert_eq!(
            outcome.sources.iter().map(|s| s.url.as_str()).collect::<Vec<_>>(),
            vec![requisits.as_str()]
        );
        assert_eq!(outcome.documents.len(), 1);
        assert!(!outcome.from_store);

        assert_eq!(outcome.answer.response, "Pots demanar la beca general [1].");
        assert_eq!(outcome.answer.citations.len(), 1);
        assert_eq!(outcome.answer.citations[0].doc_title, "Requisits de la beca");
        assert_eq!(
            outcome.answer.citations[0].source_url.as_deref(),
            Some(requisits.as_str())
        );
    }

    #[tokio::test]
    async fn ask_prefers_session_documents() {
        let (session, llm) = session(scripted_llm(), Vec::new()).await;
        session
            .store()
            .add_document(
                "Beques",
                "Les beques per a la universitat es demanen al setembre.",
                DocType::Pdf,
                None,
            )
            .await
            .unwrap();

        let outcome = session.ask(QUESTION, &SilentProgress).await.unwrap();
        assert!(outcome.from_store);
        assert!(outcome.queries.is_empty());
        assert_eq!(outcome.answer.citations[0].doc_type, DocType::Pdf);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn planner_failure_falls_back_to_question() {
        let llm = ScriptedCompletion::new()
            .with_error("planner down")
            .responding_with(|_| Ok("cap font".into()));
        let (session, _) = session(llm, Vec::new()).await;

        let outcome = session.research(QUESTION, &SilentProgress).await.unwrap();
        assert_eq!(outcome.queries, vec![QUESTION]);
        assert!(outcome.sources.is_empty());
        assert!(outcome.answer.is_no_context());
    }

    #[tokio::test]
    async fn answer_failure_degrades_to_sentinel() {
        let server = MockServer::start().await;
        mount_site(&server).await;
        let seed = Url::parse(&format!("{}/tramits/beca", server.uri())).unwrap();

        let llm = ScriptedCompletion::new().responding_with(|request| {
            let system = &request.messages[0].content;
            if system.starts_with("You turn questions") {
                Ok("beques universitat".into())
            } else if system.contains("synthesizes") {
                Ok(request.user_prompt().unwrap_or_default().to_string())
            } else {
                Err(TramitError::Completion("HTTP 500".into()))
            }
        });
        let (session, _) = session(llm, vec![seed]).await;

        let outcome = session.research(QUESTION, &SilentProgress).await.unwrap();
        assert_eq!(outcome.documents.len(), 1);
        assert!(outcome.answer.is_no_context());
    }

    #[tokio::test]
    async fn cancelled_session_does_not_crawl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let seed = Url::parse(&format!("{}/tramits/beca", server.uri())).unwrap();
        let (session, _) = session(scripted_llm(), vec![seed]).await;

        session.cancel();
        let outcome = session.research(QUESTION, &SilentProgress).await.unwrap();
        assert!(outcome.crawls.is_empty());
        assert!(outcome.sources.is_empty());
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let (session, llm) = session(scripted_llm(), Vec::new()).await;
        assert!(matches!(
            session.research("  ", &SilentProgress).await,
            Err(TramitError::Validation { .. })
        ));
        assert!(matches!(
            session.ask("", &SilentProgress).await,
            Err(TramitError::Validation { .. })
        ));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn repeated_research_does_not_duplicate_documents() {
        let server = MockServer::start().await;
        mount_site(&server).await;
        let seed = Url::parse(&format!("{}/tramits/beca", server.uri())).unwrap();
        let (session, _) = session(scripted_llm(), vec![seed]).await;

        let first = session.research(QUESTION, &SilentProgress).await.unwrap();
        let second = session.research(QUESTION, &SilentProgress).await.unwrap();
        assert_eq!(first.documents.len(), 1);
        assert!(second.documents.is_empty());
        assert_eq!(second.sources.len(), 1);
        assert_eq!(session.store().len().await, 1);
    }
}
