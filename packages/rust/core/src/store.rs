//! Per-session document store.
//!
//! Owns chunking, the embedding index and grounded answer synthesis over a
//! changing corpus. Every mutation is persisted through [`Storage`] before the
//! in-memory index changes; the `RwLock` around the index is the single
//! writer lock (add and remove hold it exclusively, searches share it).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use tramit_llm::{CompletionRequest, CompletionService, Embedder};
use tramit_shared::{
    ChunkMeta, ChunkRecord, Citation, DocType, Document, DocumentId, DocumentSummary,
    GroundedAnswer, Result, ScoredChunk, StoreConfig, TramitError,
};
use tramit_storage::Storage;

use crate::chunker::chunk_text;
use crate::index::VectorIndex;

const ANSWER_SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions based \
on the provided context. Include citation numbers [1], [2], etc. when referencing specific \
information from the context. Answer only from the context. If the context does not contain \
the answer, reply with NOT_FOUND and nothing else.";

pub struct DocumentStore {
    config: StoreConfig,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn CompletionService>,
    storage: Storage,
    index: RwLock<VectorIndex>,
}

impl DocumentStore {
    /// Open (or create) the store at `path` and rebuild its index.
    ///
    /// Fails with a validation error when the saved vectors were produced by
    /// a different embedder than `embedder`.
    #[instrument(skip_all, fields(path = %path.display(), embedder = %embedder.id()))]
    pub async fn open(
        path: &Path,
        config: StoreConfig,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn CompletionService>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(path).await?;
        let records = storage.load_chunks().await?;
        let embedder_id = embedder.id();

        match storage.embedder_id().await? {
            Some(saved) if saved != embedder_id && !records.is_empty() => {
                return Err(TramitError::validation(format!(
                    "index at {} was built with embedder '{saved}', not '{embedder_id}'",
                    path.display()
                )));
            }
            Some(saved) if saved == embedder_id => {}
            _ => storage.set_embedder_id(&embedder_id).await?,
        }

        let index = VectorIndex::from_records(records);
        info!(
            chunks = index.len(),
            documents = index.document_count(),
            "document store opened"
        );

        Ok(Self {
            config,
            embedder,
            llm,
            storage,
            index: RwLock::new(index),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Chunk, embed, persist and index a new document.
    pub async fn add_document(
        &self,
        title: &str,
        content: &str,
        doc_type: DocType,
        source_url: Option<&str>,
    ) -> Result<(Document, usize)> {
        self.add_document_with_metadata(title, content, doc_type, source_url, BTreeMap::new())
            .await
    }

    #[instrument(skip_all, fields(title = %title, doc_type = %doc_type))]
    pub async fn add_document_with_metadata(
        &self,
        title: &str,
        content: &str,
        doc_type: DocType,
        source_url: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) -> Result<(Document, usize)> {
        let chunks = chunk_text(content, self.config.chunk_size, self.config.chunk_overlap);
        if chunks.is_empty() {
            return Err(TramitError::validation(format!(
                "document '{title}' has no text to index"
            )));
        }

        let embeddings = self.embedder.embed(&chunks).await?;
        if embeddings.len() != chunks.len() {
            return Err(TramitError::Embedding(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let doc = Document {
            id: DocumentId::new(),
            title: title.to_string(),
            doc_type,
            content: content.to_string(),
            chunks,
            metadata,
            timestamp: Utc::now(),
            source_url: source_url.map(String::from),
        };

        let records: Vec<ChunkRecord> = doc
            .chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| ChunkRecord {
                meta: ChunkMeta {
                    doc_id: doc.id,
                    doc_title: doc.title.clone(),
                    doc_type: doc.doc_type,
                    chunk_index: i,
                    source_url: doc.source_url.clone(),
                },
                text: text.clone(),
                embedding,
            })
            .collect();
        let chunk_count = records.len();

        let mut index = self.index.write().await;
        self.storage.insert_document(&doc, &records).await?;
        index.append(records);

        info!(doc_id = %doc.id, chunk_count, "document added");
        Ok((doc, chunk_count))
    }

    /// Delete a document and exactly its chunks. `false` if the id is unknown.
    #[instrument(skip(self))]
    pub async fn remove_document(&self, id: &DocumentId) -> Result<bool> {
        let mut index = self.index.write().await;
        let existed = self.storage.delete_document(id).await?;
        let removed = index.remove_document(id);

        if existed {
            info!(doc_id = %id, chunks = removed, "document removed");
        } else {
            debug!(doc_id = %id, "unknown document");
        }
        Ok(existed)
    }

    // -----------------------------------------------------------------------
    // Retrieval
    // -----------------------------------------------------------------------

    /// Nearest chunks to `query`, filtered by the configured relevance threshold.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        self.search_with_threshold(query, k, self.config.relevance_threshold)
            .await
    }

    pub async fn search_with_threshold(
        &self,
        query: &str,
        k: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<ScoredChunk>> {
        let index = self.index.read().await;
        if index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TramitError::Embedding("no embedding returned for query".into()))?;

        // A query with no indexable tokens embeds to the zero vector, which
        // sits at the same distance from every unit-length chunk.
        if query_embedding.iter().all(|x| *x == 0.0) {
            debug!("query has no embeddable content");
            return Ok(Vec::new());
        }

        let hits = index.search(&query_embedding, k, threshold);
        debug!(hits = hits.len(), "similarity search");
        Ok(hits)
    }

    /// Answer `query` strictly from the `k` most relevant chunks, with one
    /// citation per chunk used.
    #[instrument(skip_all, fields(k = k))]
    pub async fn generate_response(&self, query: &str, k: usize) -> Result<GroundedAnswer> {
        let hits = self.search(query, k).await?;
        if hits.is_empty() {
            return Ok(GroundedAnswer::no_context());
        }

        let context = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| format!("[{}] {}", i + 1, hit.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!(
            "Context:\n{context}\n\nQuestion: {query} If the context is unrelated, return NOT_FOUND."
        );

        let request = CompletionRequest::new(ANSWER_SYSTEM_PROMPT, user)
            .with_temperature(self.config.answer_temperature)
            .with_max_tokens(self.config.answer_max_tokens);
        let answer = self.llm.complete(&request).await?;

        if self.is_not_found(&answer) {
            warn!("model found no answer in the retrieved context");
            return Ok(GroundedAnswer::no_context());
        }

        let citations = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| Citation {
                number: i + 1,
                doc_title: hit.meta.doc_title.clone(),
                doc_type: hit.meta.doc_type,
                source_url: hit.meta.source_url.clone(),
                content_preview: preview(&hit.text, self.config.preview_chars),
            })
            .collect();

        Ok(GroundedAnswer {
            response: answer.trim().to_string(),
            citations,
        })
    }

    /// Concatenated text of the `k` most relevant chunks, without any model call.
    pub async fn get_context(&self, query: &str, k: usize) -> Result<String> {
        let hits = self.search(query, k).await?;
        Ok(hits
            .into_iter()
            .map(|hit| hit.text)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    fn is_not_found(&self, answer: &str) -> bool {
        let answer = answer.to_lowercase();
        self.config
            .not_found_markers
            .iter()
            .any(|marker| !marker.is_empty() && answer.contains(&marker.to_lowercase()))
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        self.storage.list_documents().await
    }

    pub async fn get_document(&self, id: &DocumentId) -> Result<Option<Document>> {
        self.storage.get_document(id).await
    }

    /// Whether a document fetched from `url` is already indexed.
    pub async fn contains_source(&self, url: &str) -> bool {
        self.index.read().await.contains_source(url)
    }

    /// Number of indexed chunks belonging to `id`.
    pub async fn chunk_count(&self, id: &DocumentId) -> usize {
        self.index.read().await.chunk_count(id)
    }

    /// Number of documents in the store.
    pub async fn len(&self) -> usize {
        self.index.read().await.document_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }
}

/// First `max_chars` characters of `text`, with `...` when truncated.
fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tramit_llm::HashingEmbedder;
    use tramit_llm::testing::ScriptedCompletion;
    use tramit_shared::NO_CONTEXT_RESPONSE;
    use uuid::Uuid;

    const PADRO: &str = "padro municipal empadronament";
    const BEQUES: &str = "beques universitat estudiants";
    const CACERA: &str = "permisos caca cacera armes";

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tramit_store_{}.db", Uuid::now_v7()))
    }

    fn config() -> StoreConfig {
        StoreConfig {
            chunk_size: 30,
            chunk_overlap: 0,
            ..StoreConfig::default()
        }
    }

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::new(384).unwrap())
    }

    async fn store_with(llm: ScriptedCompletion) -> (DocumentStore, Arc<ScriptedCompletion>) {
        let llm = Arc::new(llm);
        let store = DocumentStore::open(&temp_db(), config(), embedder(), llm.clone())
            .await
            .unwrap();
        (store, llm)
    }

    fn three_part_text() -> String {
        format!("{PADRO} {BEQUES} {CACERA}")
    }

    #[tokio::test]
    async fn add_document_chunks_and_ranks() {
        let (store, _) = store_with(ScriptedCompletion::new()).await;
        let (doc, chunk_count) = store
            .add_document("Guia", &three_part_text(), DocType::Web, Some("https://x.cat/guia"))
            .await
            .unwrap();

        assert_eq!(chunk_count, 3);
        assert_eq!(doc.chunks, vec![PADRO, BEQUES, CACERA]);
        assert_eq!(store.chunk_count(&doc.id).await, 3);

        let hits = store.search("beques universitat", 3).await.unwrap();
        assert_eq!(hits[0].meta.chunk_index, 1);
        assert_eq!(hits[0].meta.doc_id, doc.id);
        assert_eq!(hits[0].meta.source_url.as_deref(), Some("https://x.cat/guia"));
    }

    #[tokio::test]
    async fn blank_document_is_rejected() {
        let (store, _) = store_with(ScriptedCompletion::new()).await;
        let err = store
            .add_document("buit", "  \n ", DocType::Pdf, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TramitError::Validation { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn remove_document_removes_only_its_chunks() {
        let (store, _) = store_with(ScriptedCompletion::new()).await;
        let (keep, _) = store
            .add_document("Padró", PADRO, DocType::Web, None)
            .await
            .unwrap();
        let (gone, _) = store
            .add_document("Beques", BEQUES, DocType::Web, None)
            .await
            .unwrap();

        assert!(store.remove_document(&gone.id).await.unwrap());
        assert!(!store.remove_document(&gone.id).await.unwrap());
        assert!(!store.remove_document(&DocumentId::new()).await.unwrap());

        let hits = store
            .search_with_threshold("beques universitat", 10, None)
            .await
            .unwrap();
        assert!(hits.iter().all(|hit| hit.meta.doc_id != gone.id));
        assert_eq!(store.chunk_count(&keep.id).await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get_document(&gone.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_without_words_retrieves_nothing() {
        let (store, llm) =
            store_with(ScriptedCompletion::new().always("Resposta inventada")).await;
        store
            .add_document("Guia", &three_part_text(), DocType::Web, None)
            .await
            .unwrap();

        assert!(store.search("???", 3).await.unwrap().is_empty());
        assert!(store.search("🙂 🙂", 3).await.unwrap().is_empty());

        let answer = store.generate_response("???", 3).await.unwrap();
        assert!(answer.is_no_context());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_store_answers_with_sentinel() {
        let (store, llm) = store_with(ScriptedCompletion::new().always("should not be called")).await;
        let answer = store.generate_response("qualsevol cosa", 3).await.unwrap();

        assert_eq!(answer.response, NO_CONTEXT_RESPONSE);
        assert!(answer.citations.is_empty());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn irrelevant_query_answers_with_sentinel() {
        let (store, llm) = store_with(ScriptedCompletion::new()).await;
        store
            .add_document("Padró", PADRO, DocType::Web, None)
            .await
            .unwrap();

        let answer = store.generate_response("vaixells pesca", 3).await.unwrap();
        assert!(answer.is_no_context());
        assert!(answer.citations.is_empty());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn grounded_answer_carries_citations() {
        let (store, llm) =
            store_with(ScriptedCompletion::new().with_reply("Pots demanar una beca [1].")).await;
        store
            .add_document("Beques", BEQUES, DocType::Pdf, Some("https://x.cat/beques"))
            .await
            .unwrap();

        let answer = store.generate_response("beques universitat", 3).await.unwrap();
        assert_eq!(answer.response, "Pots demanar una beca [1].");
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].number, 1);
        assert_eq!(answer.citations[0].doc_title, "Beques");
        assert_eq!(answer.citations[0].doc_type, DocType::Pdf);
        assert_eq!(answer.citations[0].content_preview, BEQUES);

        let request = &llm.requests()[0];
        let user = request.user_prompt().unwrap();
        assert!(user.contains(&format!("[1] {BEQUES}")));
        assert!(user.contains("Question: beques universitat"));
    }

    #[tokio::test]
    async fn not_found_markers_become_sentinel() {
        for reply in ["NOT_FOUND", "Ho sento, no he trobat la informació.", "not_found."] {
            let (store, _) = store_with(ScriptedCompletion::new().with_reply(reply)).await;
            store
                .add_document("Beques", BEQUES, DocType::Web, None)
                .await
                .unwrap();

            let answer = store.generate_response("beques universitat", 3).await.unwrap();
            assert!(answer.is_no_context(), "reply {reply:?} should be treated as not found");
        }
    }

    #[tokio::test]
    async fn completion_error_propagates() {
        let (store, _) = store_with(ScriptedCompletion::new().with_error("down")).await;
        store
            .add_document("Beques", BEQUES, DocType::Web, None)
            .await
            .unwrap();

        let err = store
            .generate_response("beques universitat", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, TramitError::Completion(_)));
    }

    #[tokio::test]
    async fn get_context_joins_chunks() {
        let (store, llm) = store_with(ScriptedCompletion::new()).await;
        store
            .add_document("Guia", &three_part_text(), DocType::Web, None)
            .await
            .unwrap();

        let context = store.get_context("beques universitat", 1).await.unwrap();
        assert_eq!(context, BEQUES);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let path = temp_db();
        let llm: Arc<dyn CompletionService> = Arc::new(ScriptedCompletion::new());
        let doc_id = {
            let store = DocumentStore::open(&path, config(), embedder(), llm.clone())
                .await
                .unwrap();
            let (doc, _) = store
                .add_document("Guia", &three_part_text(), DocType::Web, None)
                .await
                .unwrap();
            doc.id
        };

        let store = DocumentStore::open(&path, config(), embedder(), llm)
            .await
            .unwrap();
        assert_eq!(store.chunk_count(&doc_id).await, 3);
        let hits = store.search("beques universitat", 1).await.unwrap();
        assert_eq!(hits[0].meta.chunk_index, 1);

        let listed = store.list_documents().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].chunk_count, 3);
    }

    #[tokio::test]
    async fn reopening_with_other_embedder_fails() {
        let path = temp_db();
        let llm: Arc<dyn CompletionService> = Arc::new(ScriptedCompletion::new());
        {
            let store = DocumentStore::open(&path, config(), embedder(), llm.clone())
                .await
                .unwrap();
            store
                .add_document("Padró", PADRO, DocType::Web, None)
                .await
                .unwrap();
        }

        let other: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(128).unwrap());
        let result = DocumentStore::open(&path, config(), other, llm).await;
        assert!(matches!(result, Err(TramitError::Validation { .. })));
    }

    #[test]
    fn preview_truncates_on_characters() {
        assert_eq!(preview("àbc", 5), "àbc");
        assert_eq!(preview("àbcdef", 3), "àbc...");
    }
}
