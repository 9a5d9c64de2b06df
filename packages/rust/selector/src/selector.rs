use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use tramit_llm::{CompletionRequest, CompletionService};
use tramit_shared::{PageForest, SelectedSource, SelectorConfig, SourceCandidate};

use crate::urls::{extract_urls, remove_parent_urls};
use crate::verify::UrlVerifier;

const SYSTEM_PROMPT: &str = "You are a helpful assistant that synthesizes information from \
multiple sources to provide accurate and comprehensive answers. You will be given a query and \
a list of sources with their main content. Your goal is to provide a list of the sources that \
contain the information needed to answer the query. Always return all the URLs needed.";

const USER_PROMPT: &str = "Based on the following information, provide a list of the sources \
that most satisfy the query. Provide all the URLs needed (between the text).";

/// Accumulates relevant, reachable sources for one session.
///
/// The running set is keyed by URL: a URL accepted again with different
/// content replaces the earlier entry.
pub struct SourceSelector {
    config: SelectorConfig,
    llm: Arc<dyn CompletionService>,
    verifier: Arc<dyn UrlVerifier>,
    selected: BTreeMap<String, SelectedSource>,
}

impl SourceSelector {
    pub fn new(
        config: SelectorConfig,
        llm: Arc<dyn CompletionService>,
        verifier: Arc<dyn UrlVerifier>,
    ) -> Self {
        Self {
            config,
            llm,
            verifier,
            selected: BTreeMap::new(),
        }
    }

    /// Screen `candidates` in batches against `query` and add the survivors
    /// to the running set. Returns how many URLs were not in the set before.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub async fn append_sources(&mut self, query: &str, candidates: &[SourceCandidate]) -> usize {
        let before: HashSet<String> = self.selected.keys().cloned().collect();

        for batch in candidates.chunks(self.batch_size()) {
            for source in self.select_batch(query, batch).await {
                self.selected.insert(source.url.clone(), source);
            }
            if self.config.remove_parent_urls {
                self.prune();
            }
        }

        let added = self
            .selected
            .keys()
            .filter(|url| !before.contains(*url))
            .count();
        info!(added, total = self.selected.len(), "sources accumulated");
        added
    }

    /// Flatten a crawl forest (pre-order, one entry per URL) and append it.
    pub async fn append_forest(&mut self, query: &str, forest: &PageForest) -> usize {
        let candidates = forest.flatten();
        self.append_sources(query, &candidates).await
    }

    pub fn current_sources(&self) -> Vec<SelectedSource> {
        self.selected.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn reset(&mut self) {
        self.selected.clear();
    }

    /// Re-screen the whole running set against the caller's final query.
    /// The running set itself is left untouched.
    #[instrument(skip_all, fields(accumulated = self.selected.len()))]
    pub async fn final_sources(&self, query: &str) -> Vec<SelectedSource> {
        let candidates: Vec<SourceCandidate> = self
            .selected
            .values()
            .map(|s| SourceCandidate {
                url: s.url.clone(),
                title: s.title.clone(),
                content: s.content.clone(),
            })
            .collect();

        let mut kept = BTreeMap::new();
        for batch in candidates.chunks(self.batch_size()) {
            for source in self.select_batch(query, batch).await {
                kept.insert(source.url.clone(), source);
            }
        }

        let kept: Vec<SelectedSource> = kept.into_values().collect();
        let kept = if self.config.remove_parent_urls {
            remove_parent_urls(kept)
        } else {
            kept
        };
        info!(kept = kept.len(), "final sources selected");
        kept
    }

    fn batch_size(&self) -> usize {
        self.config.max_simultaneous_sources.max(1)
    }

    fn prune(&mut self) {
        let pruned = remove_parent_urls(self.selected.values().cloned().collect());
        self.selected = pruned.into_iter().map(|s| (s.url.clone(), s)).collect();
    }

    /// One synthesis round. A failed completion selects nothing.
    async fn select_batch(&self, query: &str, batch: &[SourceCandidate]) -> Vec<SelectedSource> {
        if batch.is_empty() {
            return Vec::new();
        }

        let request = CompletionRequest::new(
            SYSTEM_PROMPT,
            format!("{USER_PROMPT}{}", self.build_context(query, batch)),
        )
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens)
        .with_frequency_penalty(self.config.frequency_penalty);

        let answer = match self.llm.complete(&request).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(error = %e, batch = batch.len(), "source selection failed");
                return Vec::new();
            }
        };

        let mut picked = Vec::new();
        for url in extract_urls(&answer) {
            let Some(candidate) = batch.iter().find(|c| c.url == url) else {
                debug!(%url, "ignoring URL not offered in this batch");
                continue;
            };
            if !self.verifier.is_live(&url).await {
                debug!(%url, "ignoring unreachable URL");
                continue;
            }
            picked.push(SelectedSource::from(candidate));
        }

        debug!(offered = batch.len(), picked = picked.len(), "batch screened");
        if self.config.remove_parent_urls {
            remove_parent_urls(picked)
        } else {
            picked
        }
    }

    fn build_context(&self, query: &str, batch: &[SourceCandidate]) -> String {
        let mut context = format!("Query: {query}\n\nSources and gathered information:\n");
        for candidate in batch {
            let excerpt: String = candidate
                .content
                .chars()
                .take(self.config.max_source_chars_length)
                .collect();
            context.push_str(&format!(
                "\nSource: {}\nContent: {excerpt}...\n",
                candidate.url
            ));
        }
        context
    }
}
