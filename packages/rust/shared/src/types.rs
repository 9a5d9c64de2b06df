//! Core domain types for the Tramit retrieval pipeline.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed answer returned whenever retrieval or grounding finds nothing usable.
pub const NO_CONTEXT_RESPONSE: &str = "No relevant context found to answer the question.";

// ---------------------------------------------------------------------------
// Crawl forest
// ---------------------------------------------------------------------------

/// Index of a [`PageNode`] inside its [`PageForest`].
pub type NodeId = usize;

/// One crawled page plus the ids of its accepted children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageNode {
    /// Page URL as fetched.
    pub url: String,
    /// `<title>` or first heading, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Normalized main text of the page.
    pub main_content: String,
    /// Child pages in document order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeId>,
    /// Distance from the seed URL (seeds are depth 0).
    pub depth: u32,
}

/// Arena holding every page produced by one crawl run.
///
/// Children are always inserted before their parent, so every id stored in
/// `children` refers to an existing node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageForest {
    nodes: Vec<PageNode>,
    roots: Vec<NodeId>,
}

impl PageForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node and return its id.
    pub fn push(&mut self, node: PageNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Mark an existing node as the root of a seed tree.
    pub fn add_root(&mut self, id: NodeId) {
        if id < self.nodes.len() && !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&PageNode> {
        self.nodes.get(id)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn nodes(&self) -> &[PageNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pre-order walk (parent before children) over every root tree.
    pub fn walk(&self) -> Vec<&PageNode> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();

        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            out.push(node);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Flatten the forest into source candidates, keeping the first
    /// occurrence of each URL in pre-order.
    pub fn flatten(&self) -> Vec<SourceCandidate> {
        let mut seen = HashSet::new();
        self.walk()
            .into_iter()
            .filter(|node| seen.insert(node.url.as_str()))
            .map(|node| SourceCandidate {
                url: node.url.clone(),
                title: node.title.clone(),
                content: node.main_content.clone(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A flattened crawl page offered to the source selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Full page content (truncation only happens inside the selection prompt).
    pub content: String,
}

/// A candidate that passed relevance screening and the liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedSource {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
}

impl From<SourceCandidate> for SelectedSource {
    fn from(c: SourceCandidate) -> Self {
        Self {
            url: c.url,
            title: c.title,
            content: c.content,
        }
    }
}

impl From<&SourceCandidate> for SelectedSource {
    fn from(c: &SourceCandidate) -> Self {
        c.clone().into()
    }
}

// ---------------------------------------------------------------------------
// DocumentId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for document identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    /// Generate a new time-sortable document identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Where a document's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Pdf,
    Image,
    Web,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Web => "web",
        }
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocType {
    type Err = crate::TramitError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "image" => Ok(Self::Image),
            "web" => Ok(Self::Web),
            other => Err(crate::TramitError::validation(format!(
                "unknown document type '{other}': expected pdf, image, or web"
            ))),
        }
    }
}

/// An ingested document. Content is immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: DocType,
    pub content: String,
    /// Chunk texts in index order.
    pub chunks: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl Document {
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id,
            title: self.title.clone(),
            doc_type: self.doc_type,
            timestamp: self.timestamp,
            chunk_count: self.chunks.len(),
            source_url: self.source_url.clone(),
        }
    }
}

/// Lightweight listing entry for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: DocType,
    pub timestamp: DateTime<Utc>,
    pub chunk_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// Per-chunk metadata stored next to every index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub doc_id: DocumentId,
    pub doc_title: String,
    pub doc_type: DocType,
    pub chunk_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// One indexed unit: chunk text plus its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub meta: ChunkMeta,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A search hit. Lower `score` means more relevant (distance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub meta: ChunkMeta,
    pub text: String,
    pub score: f32,
}

// ---------------------------------------------------------------------------
// Answers
// ---------------------------------------------------------------------------

/// Citation attached to a grounded answer. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub number: usize,
    pub doc_title: String,
    pub doc_type: DocType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub content_preview: String,
}

/// Answer text plus the citations that ground it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundedAnswer {
    pub response: String,
    pub citations: Vec<Citation>,
}

impl GroundedAnswer {
    /// The fixed "nothing found" answer with no citations.
    pub fn no_context() -> Self {
        Self {
            response: NO_CONTEXT_RESPONSE.to_string(),
            citations: Vec::new(),
        }
    }

    pub fn is_no_context(&self) -> bool {
        self.response == NO_CONTEXT_RESPONSE && self.citations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, depth: u32, children: Vec<NodeId>) -> PageNode {
        PageNode {
            url: url.into(),
            title: None,
            main_content: format!("content of {url}"),
            children,
            depth,
        }
    }

    #[test]
    fn document_id_roundtrip() {
        let id = DocumentId::new();
        let parsed: DocumentId = id.to_string().parse().expect("parse DocumentId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn doc_type_parsing() {
        assert_eq!("PDF".parse::<DocType>().unwrap(), DocType::Pdf);
        assert_eq!("web".parse::<DocType>().unwrap(), DocType::Web);
        assert!("video".parse::<DocType>().is_err());
        assert_eq!(serde_json::to_string(&DocType::Image).unwrap(), "\"image\"");
    }

    #[test]
    fn flatten_is_preorder() {
        // a -> (b -> d), c
        let mut forest = PageForest::new();
        let d = forest.push(page("https://x.cat/a/b/d", 2, vec![]));
        let b = forest.push(page("https://x.cat/a/b", 1, vec![d]));
        let c = forest.push(page("https://x.cat/a/c", 1, vec![]));
        let a = forest.push(page("https://x.cat/a", 0, vec![b, c]));
        forest.add_root(a);

        let urls: Vec<String> = forest.flatten().into_iter().map(|c| c.url).collect();
        assert_eq!(
            urls,
            vec![
                "https://x.cat/a",
                "https://x.cat/a/b",
                "https://x.cat/a/b/d",
                "https://x.cat/a/c",
            ]
        );
    }

    #[test]
    fn flatten_deduplicates_urls_across_roots() {
        let mut forest = PageForest::new();
        let first = forest.push(page("https://x.cat/same", 0, vec![]));
        let second = forest.push(page("https://x.cat/same", 0, vec![]));
        forest.add_root(first);
        forest.add_root(second);

        assert_eq!(forest.len(), 2);
        assert_eq!(forest.flatten().len(), 1);
    }

    #[test]
    fn add_root_ignores_unknown_ids() {
        let mut forest = PageForest::new();
        forest.add_root(3);
        assert!(forest.roots().is_empty());
        assert!(forest.walk().is_empty());
    }

    #[test]
    fn no_context_answer() {
        let answer = GroundedAnswer::no_context();
        assert!(answer.is_no_context());
        assert_eq!(answer.response, NO_CONTEXT_RESPONSE);

        let answered = GroundedAnswer {
            response: "Use form A [1]".into(),
            citations: vec![],
        };
        assert!(!answered.is_no_context());
    }
}
